use crate::Job;
use crate::JobId;
use crate::NewJob;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use thiserror::Error;

/// The whole persisted queue state: FIFO order, id to job mapping and the id counter.
///
/// A ledger is loaded, changed and written back as one unit inside a store
/// transaction. The order and the mapping always hold exactly the same ids.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    last_id: u64,
    jobs: BTreeMap<JobId, Job>,
    job_queue: VecDeque<JobId>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("job {0} is queued but has no record")]
    MissingRecord(JobId),
    #[error("job {0} has a record but is not queued")]
    NotQueued(JobId),
    #[error("job {0} is queued more than once")]
    Duplicate(JobId),
    #[error("job {id} is stored under key {key}")]
    KeyMismatch { key: JobId, id: JobId },
    #[error("job {id} is newer than the last issued id {last_id}")]
    AheadOfCounter { id: JobId, last_id: u64 },
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a job to the back of the queue and returns its freshly issued id.
    pub fn enqueue(&mut self, new_job: NewJob) -> JobId {
        self.last_id += 1;

        let id = JobId(self.last_id);
        let job = new_job.into_job(id, Utc::now());

        self.jobs.insert(id, job);
        self.job_queue.push_back(id);

        id
    }

    /// Removes and returns the job at the front of the queue.
    pub fn pop(&mut self) -> Option<Job> {
        while let Some(id) = self.job_queue.pop_front() {
            if let Some(job) = self.jobs.remove(&id) {
                return Some(job);
            }
        }

        None
    }

    /// Removes a job wherever it sits in the queue. Unknown ids are ignored.
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&id)?;

        self.job_queue.retain(|queued| *queued != id);

        Some(job)
    }

    /// Drops every queued job. The id counter keeps its value.
    pub fn clear(&mut self) -> usize {
        let removed = self.jobs.len();

        self.jobs.clear();
        self.job_queue.clear();

        removed
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.job_queue.iter().copied()
    }

    /// Jobs in dequeue order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> + '_ {
        self.job_queue.iter().filter_map(|id| self.jobs.get(id))
    }

    pub fn len(&self) -> usize {
        self.job_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.job_queue.is_empty()
    }

    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    /// Checks that the order and the mapping agree and that no id is ahead of the
    /// counter. A ledger that fails this check is treated like an unparsable file.
    pub fn validate(&self) -> Result<(), LedgerError> {
        let mut seen = HashSet::with_capacity(self.job_queue.len());

        for id in &self.job_queue {
            if !seen.insert(*id) {
                return Err(LedgerError::Duplicate(*id));
            }

            if !self.jobs.contains_key(id) {
                return Err(LedgerError::MissingRecord(*id));
            }
        }

        for (key, job) in &self.jobs {
            if !seen.contains(key) {
                return Err(LedgerError::NotQueued(*key));
            }

            if job.id != *key {
                return Err(LedgerError::KeyMismatch {
                    key: *key,
                    id: job.id,
                });
            }

            if key.0 > self.last_id {
                return Err(LedgerError::AheadOfCounter {
                    id: *key,
                    last_id: self.last_id,
                });
            }
        }

        Ok(())
    }
}
