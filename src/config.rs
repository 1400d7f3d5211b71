// ⚙️ Run configuration - CLI arguments with environment overrides

use crate::error::PipelineError;
use crate::store::StoreConfig;
use clap::Parser;
use std::path::PathBuf;

/// Largest accepted `--working-set`.
pub const MAX_WORKING_SET: usize = 50_000_000;

/// Largest accepted `--evict-batch`; also the report page size.
pub const MAX_EVICT_BATCH: usize = 1_000_000;

/// Compute running medians of campaign contributions by zip code and by date.
#[derive(Debug, Clone, Parser)]
#[command(name = "find-donors", version)]
pub struct Config {
    /// Pipe-delimited FEC contributions file (itcont.txt layout)
    pub input: PathBuf,

    /// Output for per-record running values by recipient and zip code
    pub zip_output: PathBuf,

    /// Output for final values by recipient and date
    pub date_output: PathBuf,

    /// Number of aggregate states kept in memory
    #[arg(long, env = "FIND_DONORS_WORKING_SET", default_value_t = 100_000)]
    pub working_set: usize,

    /// States written back to disk per eviction round
    #[arg(long, default_value_t = 1_024)]
    pub evict_batch: usize,

    /// SQLite file for evicted states (default: temporary, removed on exit)
    #[arg(long, env = "FIND_DONORS_STORE")]
    pub store: Option<PathBuf>,

    /// Also reject dates that do not exist on the calendar
    #[arg(long)]
    pub strict_dates: bool,

    /// Overwrite existing output files
    #[arg(long)]
    pub force: bool,
}

impl Config {
    /// Defaults for everything but the three paths.
    pub fn new(input: impl Into<PathBuf>, zip_output: impl Into<PathBuf>, date_output: impl Into<PathBuf>) -> Self {
        let store = StoreConfig::default();
        Config {
            input: input.into(),
            zip_output: zip_output.into(),
            date_output: date_output.into(),
            working_set: store.working_set,
            evict_batch: store.evict_batch,
            store: None,
            strict_dates: false,
            force: false,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            working_set: self.working_set,
            evict_batch: self.evict_batch,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.working_set == 0 {
            return Err(PipelineError::Config("working set must hold at least one state".to_string()));
        }
        if self.working_set > MAX_WORKING_SET {
            return Err(PipelineError::Config(format!(
                "working set {} exceeds the maximum of {}",
                self.working_set, MAX_WORKING_SET
            )));
        }
        if self.evict_batch == 0 {
            return Err(PipelineError::Config("eviction batch must be at least 1".to_string()));
        }
        if self.evict_batch > MAX_EVICT_BATCH {
            return Err(PipelineError::Config(format!(
                "eviction batch {} exceeds the maximum of {}",
                self.evict_batch, MAX_EVICT_BATCH
            )));
        }

        if !self.force {
            for path in [&self.zip_output, &self.date_output] {
                if path.exists() {
                    return Err(PipelineError::Config(format!(
                        "{} already exists (use --force to overwrite)",
                        path.display()
                    )));
                }
            }
        }

        if self.zip_output == self.date_output {
            return Err(PipelineError::Config("zip and date outputs must be different files".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_positional_and_flags() {
        let config = Config::try_parse_from([
            "find-donors",
            "input/itcont.txt",
            "output/medianvals_by_zip.txt",
            "output/medianvals_by_date.txt",
            "--working-set",
            "64",
            "--strict-dates",
        ])
        .unwrap();

        assert_eq!(config.input, PathBuf::from("input/itcont.txt"));
        assert_eq!(config.working_set, 64);
        assert_eq!(config.evict_batch, 1_024);
        assert!(config.strict_dates);
        assert!(!config.force);
    }

    #[test]
    fn test_missing_positional_is_rejected() {
        assert!(Config::try_parse_from(["find-donors", "input.txt"]).is_err());
    }

    #[test]
    fn test_oversized_limits_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::try_parse_from([
            "find-donors",
            "in.txt",
            dir.path().join("zip.txt").to_str().unwrap(),
            dir.path().join("date.txt").to_str().unwrap(),
            "--working-set",
            "18446744073709551615",
        ])
        .unwrap();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        let mut config = Config::new("in.txt", dir.path().join("zip.txt"), dir.path().join("date.txt"));
        config.evict_batch = usize::MAX;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        config.evict_batch = MAX_EVICT_BATCH;
        config.working_set = MAX_WORKING_SET;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        let zip = dir.path().join("zip.txt");
        let date = dir.path().join("date.txt");

        let mut config = Config::new("in.txt", &zip, &date);
        assert!(config.validate().is_ok());

        config.working_set = 0;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
        config.working_set = 10;

        std::fs::write(&zip, "old").unwrap();
        assert!(config.validate().is_err());

        config.force = true;
        assert!(config.validate().is_ok());
    }
}
