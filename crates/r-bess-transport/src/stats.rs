//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "UDP device transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// How a single request attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Answered with a result.
    Success,
    /// No answer within the deadline.
    Timeout,
    /// Answered with an error, unparsable reply, or socket failure.
    Failure,
}

impl AttemptOutcome {
    pub fn as_label(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::Failure => "failure",
        }
    }
}

/// Counters for one method, optionally scoped to one destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandStats {
    pub attempts: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_at: Option<DateTime<Utc>>,
}

impl CommandStats {
    fn record(&mut self, outcome: AttemptOutcome, latency: Duration, error: Option<&str>) {
        self.attempts += 1;
        match outcome {
            AttemptOutcome::Success => {
                self.successes += 1;
                self.last_latency_ms = Some(latency.as_millis() as u64);
                self.last_error = None;
            }
            AttemptOutcome::Timeout => self.timeouts += 1,
            AttemptOutcome::Failure => self.failures += 1,
        }
        if let Some(error) = error {
            self.last_error = Some(error.to_owned());
        }
        self.last_at = Some(Utc::now());
    }
}

type ByMethod = HashMap<String, CommandStats>;

#[derive(Debug, Default)]
pub(crate) struct StatsBook {
    inner: Mutex<Book>,
}

#[derive(Debug, Default)]
struct Book {
    by_method: ByMethod,
    by_ip: HashMap<IpAddr, ByMethod>,
}

impl StatsBook {
    pub(crate) fn record(
        &self,
        method: &str,
        destination: IpAddr,
        outcome: AttemptOutcome,
        latency: Duration,
        error: Option<&str>,
    ) {
        let mut book = self.inner.lock();
        book.by_method
            .entry(method.to_owned())
            .or_default()
            .record(outcome, latency, error);
        book.by_ip
            .entry(destination)
            .or_default()
            .entry(method.to_owned())
            .or_default()
            .record(outcome, latency, error);
    }

    pub(crate) fn snapshot(&self) -> ByMethod {
        self.inner.lock().by_method.clone()
    }

    pub(crate) fn snapshot_for(&self, destination: IpAddr) -> ByMethod {
        self.inner
            .lock()
            .by_ip
            .get(&destination)
            .cloned()
            .unwrap_or_default()
    }
}
