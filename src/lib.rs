#![doc = include_str!("../README.md")]

use chrono::DateTime;
use chrono::Utc;
use serde::de::Error as DeError;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use typed_builder::TypedBuilder;

pub mod admission;
pub mod config;
pub mod error;
pub mod launcher;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod queue;

pub use admission::*;
pub use config::Config;
pub use error::IdleqError;
pub use launcher::*;
pub use ledger::Ledger;
pub use metrics::*;
pub use queue::*;

/// Identifier of a queued job.
///
/// Ids are handed out by the ledger counter and never reused. On disk they are
/// always written as strings, both as object keys and inside the `jobQueue` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(JobId)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        JobId(id)
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;

        match raw.parse::<JobId>() {
            Ok(JobId(0)) => Err(D::Error::custom("job id must be positive")),
            Ok(id) => Ok(id),
            Err(_) => Err(D::Error::custom(format!("invalid job id `{raw}`"))),
        }
    }
}

/// A queued shell command together with everything captured when it was submitted.
///
/// Jobs are never mutated once they are stored. They leave the queue either through
/// `pop` (and get launched) or through `remove`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[builder(setter(into))]
    pub id: JobId,
    #[builder(setter(into))]
    pub command: String,
    #[builder(setter(into))]
    pub working_directory: PathBuf,
    #[builder(default, setter(into))]
    pub environment: BTreeMap<String, String>,
    #[builder(default, setter(into))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// The submission half of a [`Job`]: everything except the id, which only the
/// ledger can assign.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct NewJob {
    #[builder(setter(into))]
    pub command: String,
    #[builder(setter(into))]
    pub working_directory: PathBuf,
    #[builder(default, setter(into))]
    pub environment: BTreeMap<String, String>,
}

impl NewJob {
    pub(crate) fn into_job(self, id: JobId, created_at: DateTime<Utc>) -> Job {
        Job::builder()
            .id(id)
            .command(self.command)
            .working_directory(self.working_directory)
            .environment(self.environment)
            .created_at(Some(created_at))
            .build()
    }
}

/// Parameters for waiting on the store lock.
///
/// A blocked transaction retries a non-blocking lock attempt, sleeping `poll_period`
/// in between. The period grows by `poll_step` up to `max_poll_period`. Once `timeout`
/// has passed the transaction gives up.
#[derive(Clone, Debug, TypedBuilder)]
pub struct LockParams {
    /// the current poll period
    #[builder(default = Duration::from_millis(10))]
    pub poll_period: Duration,
    /// the poll period never grows beyond this value
    #[builder(default = Duration::from_millis(250))]
    pub max_poll_period: Duration,
    /// the initial value of `poll_period`
    #[builder(default = Duration::from_millis(10))]
    pub min_poll_period: Duration,
    /// the step `poll_period` is increased by after every failed attempt
    #[builder(default = Duration::from_millis(20))]
    pub poll_step: Duration,
    /// how long to wait for the lock in total
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
}

impl LockParams {
    /// Reset the `poll_period` to `min_poll_period`
    pub fn reset_poll_period(&mut self) {
        if self.poll_period != self.min_poll_period {
            self.poll_period = self.min_poll_period;
        }
    }

    /// Increase the `poll_period` by `poll_step` if `max_poll_period` is not reached
    pub fn maybe_increase_poll_period(&mut self) {
        if self.poll_period < self.max_poll_period {
            self.poll_period = (self.poll_period + self.poll_step).min(self.max_poll_period);
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::builder().timeout(timeout).build()
    }
}

impl Default for LockParams {
    fn default() -> Self {
        Self::builder().build()
    }
}
