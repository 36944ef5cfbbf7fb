use crate::core::{BackupError, ErrorKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{Level, event};

/// A reported backup failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub raised_at: DateTime<Utc>,
    pub collection: String,
    /// `snapshot`, `stream` or `overwrite`.
    pub operation: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    pub consecutive_failures: u32,
    /// Consecutive failures reached the escalation threshold.
    pub escalated: bool,
}

/// Keeps the most recent alerts and mirrors each one to the log.
#[derive(Debug)]
pub struct AlertReporter {
    recent: Mutex<VecDeque<Alert>>,
    capacity: usize,
    escalate_after: u32,
}

impl AlertReporter {
    pub fn new(capacity: usize, escalate_after: u32) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            escalate_after: escalate_after.max(1),
        }
    }

    pub fn escalate_after(&self) -> u32 {
        self.escalate_after
    }

    pub fn report(
        &self,
        collection: &str,
        operation: &'static str,
        error: &BackupError,
        consecutive_failures: u32,
        raised_at: DateTime<Utc>,
    ) -> Alert {
        let escalated = consecutive_failures >= self.escalate_after;
        let alert = Alert {
            raised_at,
            collection: collection.to_string(),
            operation,
            kind: error.kind(),
            message: error.to_string(),
            consecutive_failures,
            escalated,
        };

        if escalated {
            event!(
                Level::ERROR,
                collection,
                operation,
                kind = %alert.kind,
                retry_count = consecutive_failures,
                error = %error,
                "backup failing repeatedly"
            );
        } else {
            event!(
                Level::WARN,
                collection,
                operation,
                kind = %alert.kind,
                retry_count = consecutive_failures,
                error = %error,
                "backup failed"
            );
        }

        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(alert.clone());
        }
        alert
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<Alert> {
        self.recent
            .lock()
            .map(|recent| recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn escalated(&self) -> Vec<Alert> {
        self.recent().into_iter().filter(|a| a.escalated).collect()
    }
}

impl Default for AlertReporter {
    fn default() -> Self {
        Self::new(256, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_third_failure_escalates_and_log_is_bounded() {
        let reporter = AlertReporter::new(2, 3);
        let err = BackupError::CodecError("corrupt frame".into());
        let now = Utc::now();
        assert!(!reporter.report("trades", "snapshot", &err, 1, now).escalated);
        assert!(!reporter.report("trades", "snapshot", &err, 2, now).escalated);
        let third = reporter.report("trades", "snapshot", &err, 3, now);
        assert!(third.escalated);
        assert_eq!(third.kind, ErrorKind::Codec);

        let recent = reporter.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].consecutive_failures, 3);
        assert_eq!(reporter.escalated().len(), 1);
    }
}
