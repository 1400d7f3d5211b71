// Find Donors - Core Library
// Running medians of campaign contributions by recipient+zip and recipient+date

pub mod record;
pub mod median;
pub mod aggregate;
pub mod store;
pub mod aggregator;
pub mod report;
pub mod config;
pub mod error;
pub mod pipeline;

// Re-export commonly used types
pub use record::{
    Contribution, Discard, RecordValidator, Schema, TransactionDate,
    validate,
};
pub use median::{EmptyTracker, MedianTracker};
pub use aggregate::{AggregateState, GroupKey, Namespace};
pub use store::{
    AggregateStore, KvBackend, MemoryBackend, SqliteBackend,
    StoreConfig, StoreError, StoreStats,
};
pub use aggregator::{RunStats, StreamingAggregator, ZipLine};
pub use report::{write_date_report, DateLine};
pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{process, run, RunSummary};
