//! 🚨 ErrorMonitor: three circuit breakers in a trench coat.
//!
//! A burst of failures trips the consecutive breaker. A slow leak trips the total breaker.
//! A steady drizzle just under the radar trips the window breaker, or `finalize` catches it
//! at the end. Any one of them aborts the sync instead of quietly under-indexing. 🦆

use std::collections::VecDeque;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ErrorMonitorConfig {
    #[serde(default = "default_max_errors")]
    pub max_errors: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u64,
    #[serde(default = "default_max_error_ratio")]
    pub max_error_ratio: f64,
    #[serde(default = "default_window_size", alias = "max_errors_in_window")]
    pub window_size: usize,
    #[serde(default = "default_error_queue_size")]
    pub error_queue_size: usize,
}

fn default_max_errors() -> u64 {
    1000
}

fn default_max_consecutive_errors() -> u64 {
    10
}

// 15% of the documents failing is where "flaky" turns into "broken"
fn default_max_error_ratio() -> f64 {
    0.15
}

fn default_window_size() -> usize {
    100
}

fn default_error_queue_size() -> usize {
    20
}

impl Default for ErrorMonitorConfig {
    fn default() -> Self {
        Self {
            max_errors: default_max_errors(),
            max_consecutive_errors: default_max_consecutive_errors(),
            max_error_ratio: default_max_error_ratio(),
            window_size: default_window_size(),
            error_queue_size: default_error_queue_size(),
        }
    }
}

/// 📝 One remembered per-document failure.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentError {
    /// innermost message of the error chain
    pub root_cause: String,
    pub error_message: String,
    pub stack_trace: String,
    pub error_id: String,
}

impl DocumentError {
    fn from_error(error: &anyhow::Error, id: Option<&str>) -> Self {
        Self {
            root_cause: error.root_cause().to_string(),
            error_message: error.to_string(),
            stack_trace: format!("{error:?}"),
            error_id: id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }
}

/// 💥 The breaker that tripped, with the error that tripped it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MonitoringError {
    #[error("Exceeded maximum consecutive errors - saw {count} errors in a row.{}", tripped_suffix(.tripped_by))]
    MaxSuccessiveErrorsExceeded {
        count: u64,
        tripped_by: Option<String>,
    },
    #[error("Exceeded maximum number of errors - saw {count} errors in total.{}", tripped_suffix(.tripped_by))]
    MaxErrorsExceeded {
        count: u64,
        tripped_by: Option<String>,
    },
    #[error("{message}{}", tripped_suffix(.tripped_by))]
    MaxErrorsInWindowExceeded {
        message: String,
        tripped_by: Option<String>,
    },
}

impl MonitoringError {
    pub fn tripped_by(&self) -> Option<&str> {
        match self {
            MonitoringError::MaxSuccessiveErrorsExceeded { tripped_by, .. }
            | MonitoringError::MaxErrorsExceeded { tripped_by, .. }
            | MonitoringError::MaxErrorsInWindowExceeded { tripped_by, .. } => tripped_by.as_deref(),
        }
    }
}

fn tripped_suffix(tripped_by: &Option<String>) -> String {
    match tripped_by {
        Some(cause) => format!(" Tripped by - {cause}"),
        None => String::new(),
    }
}

#[derive(Debug)]
pub struct ErrorMonitor {
    config: ErrorMonitorConfig,
    total_error_count: u64,
    consecutive_error_count: u64,
    success_count: u64,
    window: Vec<bool>,
    window_index: usize,
    error_queue: VecDeque<DocumentError>,
    last_error: Option<String>,
}

impl ErrorMonitor {
    pub fn new(config: ErrorMonitorConfig) -> Self {
        Self {
            window: vec![false; config.window_size],
            error_queue: VecDeque::with_capacity(config.error_queue_size),
            config,
            total_error_count: 0,
            consecutive_error_count: 0,
            success_count: 0,
            window_index: 0,
            last_error: None,
        }
    }

    pub fn note_success(&mut self) {
        self.consecutive_error_count = 0;
        self.success_count += 1;
        self.record_in_window(false);
    }

    /// 🧯 Record a failure, then check the breakers. `Err` means the sync must stop.
    pub fn note_error(
        &mut self,
        error: &anyhow::Error,
        id: Option<&str>,
    ) -> Result<(), MonitoringError> {
        let document_error = DocumentError::from_error(error, id);
        debug!(
            "🧯 Noting document error {} ({} so far): {}",
            document_error.error_id,
            self.total_error_count + 1,
            document_error.error_message
        );

        self.total_error_count += 1;
        self.consecutive_error_count += 1;
        self.record_in_window(true);

        if self.config.error_queue_size > 0 {
            if self.error_queue.len() == self.config.error_queue_size {
                self.error_queue.pop_front();
            }
            self.error_queue.push_back(document_error);
        }
        self.last_error = Some(format!("{error:#}"));

        self.raise_if_necessary()
    }

    /// 🏁 End-of-job check over the whole run, not just the window.
    pub fn finalize(&self) -> Result<(), MonitoringError> {
        let total_documents = self.total_error_count + self.success_count;
        if total_documents == 0 || self.total_error_count == 0 {
            return Ok(());
        }
        let ratio = self.total_error_count as f64 / total_documents as f64;
        if ratio > self.config.max_error_ratio {
            warn!(
                "🚨 Sync error ratio {:.3} is above the allowed {:.3}",
                ratio, self.config.max_error_ratio
            );
            return Err(MonitoringError::MaxErrorsInWindowExceeded {
                message: format!(
                    "There were {} errors out of {} total documents",
                    self.total_error_count, total_documents
                ),
                tripped_by: self.last_error.clone(),
            });
        }
        Ok(())
    }

    pub fn error_queue(&self) -> impl Iterator<Item = &DocumentError> {
        self.error_queue.iter()
    }

    pub fn total_error_count(&self) -> u64 {
        self.total_error_count
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    fn record_in_window(&mut self, is_error: bool) {
        if self.window.is_empty() {
            return;
        }
        self.window[self.window_index] = is_error;
        self.window_index = (self.window_index + 1) % self.window.len();
    }

    fn raise_if_necessary(&self) -> Result<(), MonitoringError> {
        if self.consecutive_error_count > self.config.max_consecutive_errors {
            return Err(MonitoringError::MaxSuccessiveErrorsExceeded {
                count: self.consecutive_error_count,
                tripped_by: self.last_error.clone(),
            });
        }

        if self.total_error_count > self.config.max_errors {
            return Err(MonitoringError::MaxErrorsExceeded {
                count: self.total_error_count,
                tripped_by: self.last_error.clone(),
            });
        }

        if !self.window.is_empty() {
            let errors_in_window = self.window.iter().filter(|flag| **flag).count();
            let ratio = errors_in_window as f64 / self.window.len() as f64;
            if ratio > self.config.max_error_ratio {
                return Err(MonitoringError::MaxErrorsInWindowExceeded {
                    message: format!(
                        "Exceeded maximum error ratio of {} for last {} documents - saw {} errors.",
                        self.config.max_error_ratio,
                        self.window.len(),
                        errors_in_window
                    ),
                    tripped_by: self.last_error.clone(),
                });
            }
        }

        Ok(())
    }
}
