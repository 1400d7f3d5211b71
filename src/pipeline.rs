// 🚰 Pipeline - input file -> validator -> aggregator -> outputs
// Single pass, single thread, strictly in input order

use crate::aggregator::{RunStats, StreamingAggregator};
use crate::config::Config;
use crate::error::PipelineError;
use crate::record::{RecordValidator, DELIMITER};
use crate::report::write_date_report;
use crate::store::{AggregateStore, KvBackend, SqliteBackend, StoreStats};
use csv::{ByteRecord, ReaderBuilder, StringRecord};
use log::{info, trace};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stats: RunStats,
    pub store: StoreStats,
    pub date_lines: u64,
    pub elapsed: Duration,
}

/// Run the whole job described by `config`.
pub fn run(config: &Config) -> Result<RunSummary, PipelineError> {
    config.validate()?;
    let started = Instant::now();

    let input = File::open(&config.input).map_err(|e| PipelineError::Input {
        path: config.input.clone(),
        source: e.into(),
    })?;

    let mut backend = match &config.store {
        Some(path) => SqliteBackend::open(path)?,
        None => SqliteBackend::scratch()?,
    };
    backend.reset()?;
    let store = AggregateStore::new(backend, config.store_config());

    let zip_out = create_output(&config.zip_output)?;
    let mut date_out = create_output(&config.date_output)?;

    let validator = RecordValidator::new(config.strict_dates);
    let (stats, store_stats, date_lines) = process(
        input,
        &config.input,
        &validator,
        store,
        zip_out,
        &config.zip_output,
        &mut date_out,
        &config.date_output,
    )?;

    let summary = RunSummary {
        stats,
        store: store_stats,
        date_lines,
        elapsed: started.elapsed(),
    };

    info!("{}", summary.stats.summary());
    info!(
        "Store: {} keys, {} hits, {} reloads, {} evictions, {} write-backs",
        summary.store.creates, summary.store.hits, summary.store.loads, summary.store.evictions, summary.store.write_backs
    );
    info!("Elapsed time: {:.3}s", summary.elapsed.as_secs_f64());

    Ok(summary)
}

fn create_output(path: &Path) -> Result<BufWriter<File>, PipelineError> {
    let file = File::create(path).map_err(PipelineError::output(path))?;
    Ok(BufWriter::new(file))
}

/// Stream every record of `input` through validation and aggregation, then
/// write the date report. Generic over the reader, writers and backend.
#[allow(clippy::too_many_arguments)]
pub fn process<R: Read, B: KvBackend, Z: Write, D: Write>(
    input: R,
    input_path: &Path,
    validator: &RecordValidator,
    store: AggregateStore<B>,
    zip_out: Z,
    zip_path: &Path,
    date_out: &mut D,
    date_path: &Path,
) -> Result<(RunStats, StoreStats, u64), PipelineError> {
    // FEC files are unquoted, one record per line, occasionally not UTF-8
    let mut reader = ReaderBuilder::new()
        .delimiter(DELIMITER)
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(input);

    let mut aggregator = StreamingAggregator::new(store, zip_out, zip_path);
    let mut raw = ByteRecord::new();

    while reader.read_byte_record(&mut raw).map_err(PipelineError::input(input_path))? {
        let record = StringRecord::from_byte_record_lossy(raw.clone());

        match validator.validate(&record) {
            Ok(contribution) => {
                aggregator.absorb(&contribution)?;
            }
            Err(reason) => {
                trace!("Discarded line {}: {}", raw.position().map_or(0, |p| p.line()), reason);
                aggregator.discard(reason);
            }
        }
    }

    let (mut store, _, stats) = aggregator.finish()?;
    let date_lines = write_date_report(&mut store, date_out, date_path)?;

    Ok((stats, store.stats(), date_lines))
}
