//! Conversion jobs and the queue message that carries them.
//!
//! A job has no record outside its queue message and the files in shared
//! storage: the message carries everything needed to reprocess it from
//! scratch, and completion is the presence of the derived target file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::converter::ConversionOptions;
use crate::storage::{SafeName, StorageError};

/// Default number of processing attempts before a message is discarded.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Queue message for one spreadsheet conversion.
///
/// `xlsx` / `lo_options` are accepted as aliases so messages written by
/// older producers still decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
    #[serde(default = "new_job_id")]
    pub job_id: String,
    #[serde(alias = "xlsx")]
    pub filename: String,
    #[serde(default, alias = "lo_options")]
    pub options: ConversionOptions,
    #[serde(default)]
    pub delete_original: bool,
    /// Number of attempts already made; 0 for a fresh message.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
}

fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

impl ConversionJob {
    pub fn new(filename: &SafeName, options: ConversionOptions, delete_original: bool) -> Self {
        Self {
            job_id: new_job_id(),
            filename: filename.to_string(),
            options,
            delete_original,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Source filename, validated again on the consumer side since the
    /// message may come from any producer.
    pub fn source(&self) -> Result<SafeName, StorageError> {
        SafeName::parse(&self.filename)
    }

    pub fn target(&self) -> Result<SafeName, StorageError> {
        self.source().map(|s| s.pdf_target())
    }

    /// Records a failed attempt. Returns `true` if the job may be redelivered,
    /// `false` once `max_attempts` attempts have been spent.
    pub fn retry(&mut self, max_attempts: u32) -> bool {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt < max_attempts
    }

    pub fn queued_for_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.enqueued_at)
            .num_milliseconds()
    }
}

/// Terminal states of one consumed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Output committed, message acknowledged.
    Completed,
    /// Output already present from an earlier delivery; acknowledged without work.
    AlreadyDone,
    /// Failed and returned to the queue for another attempt.
    Requeued,
    /// Failed permanently; acknowledged and dropped.
    Discarded,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Completed => write!(f, "completed"),
            JobOutcome::AlreadyDone => write!(f, "already_done"),
            JobOutcome::Requeued => write!(f, "requeued"),
            JobOutcome::Discarded => write!(f, "discarded"),
        }
    }
}
