use crate::backup::coordinator::{FinishReport, Progress};
use crate::backup::cursor::sqlite::{default_schema, BackupOptions};
use crate::backup::job::{
    backup_database, StepPolicy, DEFAULT_BUSY_RETRY_DELAY, DEFAULT_MAX_BUSY_RETRIES,
};
use crate::backup::page_count::PageCount;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use crate::backup::validate::{validate_destination_path, validate_schema_name, validate_sql_file};
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use validator::Validate;

/// One source database copied into one destination file.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
pub struct BackupJobConfig {
    #[validate(custom(function = validate_sql_file))]
    pub source: Arc<Path>,
    #[validate(custom(function = validate_destination_path))]
    pub destination: Arc<Path>,
    #[serde(default = "default_schema")]
    #[validate(custom(function = validate_schema_name))]
    pub source_schema: Arc<str>,
    #[serde(default = "default_schema")]
    #[validate(custom(function = validate_schema_name))]
    pub destination_schema: Arc<str>,
    /// Pages copied per round; absent copies everything in a single round.
    #[validate(range(min = 1))]
    pub pages_per_step: Option<u32>,
    #[serde(default = "default_busy_retry_delay", with = "humantime_serde")]
    pub busy_retry_delay: std::time::Duration,
    #[serde(default = "default_max_busy_retries")]
    pub max_busy_retries: u32,
    #[validate(range(min = 1))]
    pub worker_threads: Option<usize>,
}

fn default_busy_retry_delay() -> std::time::Duration {
    DEFAULT_BUSY_RETRY_DELAY
}

fn default_max_busy_retries() -> u32 {
    DEFAULT_MAX_BUSY_RETRIES
}

impl BackupJobConfig {
    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions::builder()
            .source_schema(self.source_schema.clone())
            .destination_schema(self.destination_schema.clone())
            .build()
    }

    pub fn step_policy(&self) -> StepPolicy {
        StepPolicy::builder()
            .rate(PageCount::from(self.pages_per_step.and_then(NonZeroU32::new)))
            .busy_retry_delay(self.busy_retry_delay)
            .max_busy_retries(self.max_busy_retries)
            .build()
    }

    /// Runs the backup on `pool`, logging progress as it goes.
    pub fn run(&self, pool: Arc<ThreadPool>) -> Result<FinishReport> {
        let report = backup_database(
            pool,
            &self.source,
            &self.destination,
            &self.backup_options(),
            &self.step_policy(),
            |p: Progress| info!("Copied {}/{} pages", p.copied(), p.total),
        )
        .with_debug_object_and_fn_name(self.clone(), "run")?;
        info!(
            "Backup of {:?} into {:?} {}",
            self.source,
            self.destination,
            report.status()
        );
        Ok(report)
    }
}
