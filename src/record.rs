// 🧾 Record Validator - FEC contribution records
// Turns one pipe-delimited record into a typed Contribution or a Discard

use chrono::NaiveDate;
use csv::StringRecord;
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// SCHEMA DESCRIPTOR
// ============================================================================

/// Fixed layout of the FEC individual-contributions file (itcont.txt).
///
/// Only five positions are load-bearing; every other field is carried
/// along by the reader and ignored here.
pub struct Schema;

impl Schema {
    pub const FIELD_COUNT: usize = 21;
    pub const CMTE_ID: usize = 0;
    pub const ZIP_CODE: usize = 10;
    pub const TRANSACTION_DT: usize = 13;
    pub const TRANSACTION_AMT: usize = 14;
    pub const OTHER_ID: usize = 15;
}

pub const DELIMITER: u8 = b'|';

// ============================================================================
// CORE TYPES
// ============================================================================

/// Calendar date as written in the feed (MMDDYYYY).
///
/// Ordering is calendar order: year, then month, then day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionDate {
    pub month: u8,
    pub day: u8,
    pub year: u16,
}

impl TransactionDate {
    /// Parse exactly eight ASCII digits as MMDDYYYY. No calendar check.
    pub fn parse(raw: &str) -> Option<Self> {
        let bytes = raw.as_bytes();
        if bytes.len() != 8 || !bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }

        let month = raw[0..2].parse().ok()?;
        let day = raw[2..4].parse().ok()?;
        let year = raw[4..8].parse().ok()?;

        Some(TransactionDate { month, day, year })
    }

    /// True when the date exists on the proleptic Gregorian calendar.
    pub fn is_calendar_date(&self) -> bool {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32).is_some()
    }

    /// YYYYMMDD, the byte-sortable form used in store keys.
    pub fn sortable(&self) -> String {
        format!("{:04}{:02}{:02}", self.year, self.month, self.day)
    }

    /// Inverse of `sortable`.
    pub fn from_sortable(raw: &str) -> Option<Self> {
        let bytes = raw.as_bytes();
        if bytes.len() != 8 || !bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }

        Some(TransactionDate {
            year: raw[0..4].parse().ok()?,
            month: raw[4..6].parse().ok()?,
            day: raw[6..8].parse().ok()?,
        })
    }
}

impl Ord for TransactionDate {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.year, self.month, self.day).cmp(&(other.year, other.month, other.day))
    }
}

impl PartialOrd for TransactionDate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TransactionDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}{:02}{:04}", self.month, self.day, self.year)
    }
}

/// A record that passed every validity predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    pub recipient_id: String,
    pub zip5: String,
    pub transaction_date: TransactionDate,
    pub amount_cents: u64,
}

/// Why a record was excluded from the aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Discard {
    FieldCount,
    OtherIdPresent,
    InvalidZip,
    InvalidDate,
    NegativeAmount,
    InvalidAmount,
    MissingRecipient,
}

impl Discard {
    pub fn name(&self) -> &'static str {
        match self {
            Discard::FieldCount => "field_count",
            Discard::OtherIdPresent => "other_id_present",
            Discard::InvalidZip => "invalid_zip",
            Discard::InvalidDate => "invalid_date",
            Discard::NegativeAmount => "negative_amount",
            Discard::InvalidAmount => "invalid_amount",
            Discard::MissingRecipient => "missing_recipient",
        }
    }
}

impl fmt::Display for Discard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// PREDICATES
// ============================================================================

pub fn check_field_count(record: &StringRecord) -> Result<(), Discard> {
    if record.len() == Schema::FIELD_COUNT {
        Ok(())
    } else {
        Err(Discard::FieldCount)
    }
}

/// A non-empty OTHER_ID marks a contribution from an entity, not an individual.
pub fn check_other_id(raw: &str) -> Result<(), Discard> {
    if raw.is_empty() {
        Ok(())
    } else {
        Err(Discard::OtherIdPresent)
    }
}

/// Keep the leading five characters (ZIP+4 suffixes are dropped); they must
/// all be ASCII digits.
pub fn parse_zip5(raw: &str) -> Result<String, Discard> {
    let zip5: String = raw.chars().take(5).collect();
    if zip5.len() == 5 && zip5.bytes().all(|b| b.is_ascii_digit()) {
        Ok(zip5)
    } else {
        Err(Discard::InvalidZip)
    }
}

pub fn parse_date(raw: &str, strict_calendar: bool) -> Result<TransactionDate, Discard> {
    let date = TransactionDate::parse(raw).ok_or(Discard::InvalidDate)?;
    if strict_calendar && !date.is_calendar_date() {
        return Err(Discard::InvalidDate);
    }
    Ok(date)
}

pub fn parse_amount(raw: &str) -> Result<u64, Discard> {
    let raw = raw.trim();
    if raw.starts_with('-') {
        return Err(Discard::NegativeAmount);
    }
    raw.parse::<u64>().map_err(|_| Discard::InvalidAmount)
}

pub fn check_recipient(raw: &str) -> Result<String, Discard> {
    if raw.is_empty() {
        Err(Discard::MissingRecipient)
    } else {
        Ok(raw.to_string())
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

/// Pure record validator. Holds only policy, never state.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordValidator {
    /// Also require dates to exist on the calendar (rejects 02302020).
    pub strict_dates: bool,
}

impl RecordValidator {
    pub fn new(strict_dates: bool) -> Self {
        RecordValidator { strict_dates }
    }

    /// Validate one raw record.
    ///
    /// Predicates run in a fixed order; the first failure is the reported
    /// reason. Discards are not errors: the caller just skips the record.
    pub fn validate(&self, record: &StringRecord) -> Result<Contribution, Discard> {
        check_field_count(record)?;

        // Field count is checked, so every schema position exists.
        let field = |idx: usize| record.get(idx).unwrap_or("");

        check_other_id(field(Schema::OTHER_ID))?;
        let zip5 = parse_zip5(field(Schema::ZIP_CODE))?;
        let transaction_date = parse_date(field(Schema::TRANSACTION_DT), self.strict_dates)?;
        let amount_cents = parse_amount(field(Schema::TRANSACTION_AMT))?;
        let recipient_id = check_recipient(field(Schema::CMTE_ID))?;

        Ok(Contribution {
            recipient_id,
            zip5,
            transaction_date,
            amount_cents,
        })
    }
}

/// Validate with the default (format-only) policy.
pub fn validate(record: &StringRecord) -> Result<Contribution, Discard> {
    RecordValidator::default().validate(record)
}
