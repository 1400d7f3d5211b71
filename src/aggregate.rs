// 📊 Aggregates - grouping keys and per-key running state

use crate::median::{EmptyTracker, MedianTracker};
use crate::record::{Contribution, TransactionDate};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// GROUP KEY
// ============================================================================

/// Which grouping scheme a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Zip,
    Date,
}

impl Namespace {
    /// Leading byte of every encoded key in this namespace.
    pub fn tag(&self) -> u8 {
        match self {
            Namespace::Zip => b'Z',
            Namespace::Date => b'D',
        }
    }
}

/// Identity under which contributions are aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Zip { recipient_id: String, zip5: String },
    Date { recipient_id: String, transaction_date: TransactionDate },
}

impl GroupKey {
    pub fn zip(contribution: &Contribution) -> Self {
        GroupKey::Zip {
            recipient_id: contribution.recipient_id.clone(),
            zip5: contribution.zip5.clone(),
        }
    }

    pub fn date(contribution: &Contribution) -> Self {
        GroupKey::Date {
            recipient_id: contribution.recipient_id.clone(),
            transaction_date: contribution.transaction_date,
        }
    }

    pub fn namespace(&self) -> Namespace {
        match self {
            GroupKey::Zip { .. } => Namespace::Zip,
            GroupKey::Date { .. } => Namespace::Date,
        }
    }

    pub fn recipient_id(&self) -> &str {
        match self {
            GroupKey::Zip { recipient_id, .. } | GroupKey::Date { recipient_id, .. } => recipient_id.as_str(),
        }
    }

    /// Order-preserving byte encoding: tag, fixed-width field, recipient.
    ///
    /// The fixed-width field comes first so no separator is needed. For
    /// date keys byte order equals (date ascending, recipient ascending).
    pub fn encode(&self) -> Vec<u8> {
        let (fixed, recipient_id) = match self {
            GroupKey::Zip { recipient_id, zip5 } => (zip5.clone(), recipient_id),
            GroupKey::Date { recipient_id, transaction_date } => (transaction_date.sortable(), recipient_id),
        };

        let mut out = Vec::with_capacity(1 + fixed.len() + recipient_id.len());
        out.push(self.namespace().tag());
        out.extend_from_slice(fixed.as_bytes());
        out.extend_from_slice(recipient_id.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&tag, rest) = bytes.split_first()?;
        if rest.len() < 5 {
            return None;
        }
        let text = std::str::from_utf8(rest).ok()?;

        match tag {
            b'Z' => {
                let (zip5, recipient_id) = (text.get(..5)?, text.get(5..)?);
                Some(GroupKey::Zip {
                    recipient_id: recipient_id.to_string(),
                    zip5: zip5.to_string(),
                })
            }
            b'D' => {
                let (date, recipient_id) = (text.get(..8)?, text.get(8..)?);
                Some(GroupKey::Date {
                    recipient_id: recipient_id.to_string(),
                    transaction_date: TransactionDate::from_sortable(date)?,
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Zip { recipient_id, zip5 } => write!(f, "{}|{}", recipient_id, zip5),
            GroupKey::Date { recipient_id, transaction_date } => {
                write!(f, "{}|{}", recipient_id, transaction_date)
            }
        }
    }
}

// ============================================================================
// AGGREGATE STATE
// ============================================================================

/// Running count, total and median for one key.
///
/// A fresh state has count 0; it reaches 1 on the first `absorb`, which
/// always happens in the same update cycle that created it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateState {
    pub count: u64,
    pub total_cents: u64,
    pub tracker: MedianTracker,
}

impl AggregateState {
    pub fn absorb(&mut self, amount_cents: u64) {
        self.count += 1;
        self.total_cents = self.total_cents.saturating_add(amount_cents);
        self.tracker.insert(amount_cents);
    }

    pub fn median(&self) -> Result<u64, EmptyTracker> {
        self.tracker.median()
    }
}
