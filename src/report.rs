// 📅 Report Emitter - final per-(recipient, date) values, calendar-sorted

use crate::aggregate::{GroupKey, Namespace};
use crate::aggregator::median_of;
use crate::error::PipelineError;
use crate::record::TransactionDate;
use crate::store::{AggregateStore, KvBackend, StoreError};
use log::info;
use std::fmt;
use std::io::Write;
use std::path::Path;

/// One line of the date report: `recipient|MMDDYYYY|median|count|total`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateLine {
    pub recipient_id: String,
    pub transaction_date: TransactionDate,
    pub median_cents: u64,
    pub count: u64,
    pub total_cents: u64,
}

impl fmt::Display for DateLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.recipient_id, self.transaction_date, self.median_cents, self.count, self.total_cents
        )
    }
}

/// Write one line per date key, ordered by (date, recipient).
///
/// Keys arrive from the store already in that order, one page at a time,
/// so the report never holds the full key set. Returns the line count.
pub fn write_date_report<B: KvBackend, W: Write>(
    store: &mut AggregateStore<B>,
    out: &mut W,
    path: &Path,
) -> Result<u64, PipelineError> {
    let mut written = 0;

    for entry in store.scan(Namespace::Date)? {
        let (key, state) = entry?;
        let GroupKey::Date {
            recipient_id,
            transaction_date,
        } = &key
        else {
            return Err(StoreError::Corrupt(format!("zip key {} in date namespace", key)).into());
        };

        let line = DateLine {
            recipient_id: recipient_id.clone(),
            transaction_date: *transaction_date,
            median_cents: median_of(&key, &state)?,
            count: state.count,
            total_cents: state.total_cents,
        };
        writeln!(out, "{}", line).map_err(PipelineError::output(path))?;
        written += 1;
    }

    out.flush().map_err(PipelineError::output(path))?;
    info!("Wrote {} date lines to {}", written, path.display());

    Ok(written)
}
