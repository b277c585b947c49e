use crate::ledger::Ledger;
use crate::ledger::LedgerError;
use crate::lock::LockError;
use crate::lock::LockedFile;
use crate::Job;
use crate::JobId;
use crate::LockParams;
use crate::NewJob;
use chrono::Utc;
use log::info;
use log::warn;
use std::ffi::OsString;
use std::fs;
use std::fs::File;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use typed_builder::TypedBuilder;

#[cfg(test)]
mod queue_tests;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    SerdeError(#[from] serde_json::Error),
    #[error("The queue file {path} is corrupt: {reason}")]
    CorruptStore { path: PathBuf, reason: String },
    #[error("Timed out after {waited:?} waiting for the lock on {path}")]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error(transparent)]
    LockError(LockError),
}

impl From<LockError> for QueueError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Timeout { path, waited } => QueueError::LockTimeout { path, waited },
            other => QueueError::LockError(other),
        }
    }
}

/// This trait defines the operations of the job store.
///
/// Every method is one transaction: the implementation must make it atomic with
/// respect to every other call, including calls from other processes.
pub trait Queueable {
    /// Append a job to the back of the queue and return its id.
    fn enqueue(&self, new_job: NewJob) -> Result<JobId, QueueError>;

    /// Remove and return the job at the front of the queue.
    /// An empty queue is not an error, `None` is returned instead.
    fn pop(&self) -> Result<Option<Job>, QueueError>;

    /// Remove a job by its id. Returns the number of removed jobs, so 0 for unknown ids.
    fn remove(&self, id: JobId) -> Result<usize, QueueError>;

    /// Remove every queued job.
    fn clear(&self) -> Result<usize, QueueError>;

    /// Snapshot of the queued jobs in dequeue order.
    fn list(&self) -> Result<Listing, QueueError>;

    fn find(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    fn count(&self) -> Result<usize, QueueError>;
}

/// Jobs as they were queued when the listing transaction ran.
///
/// The snapshot does not hold the store lock, it can be iterated any number of times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    jobs: Vec<Job>,
}

impl Listing {
    pub fn iter(&self) -> std::slice::Iter<'_, Job> {
        self.jobs.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.jobs.iter().map(|job| job.id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl<'a> IntoIterator for &'a Listing {
    type Item = &'a Job;
    type IntoIter = std::slice::Iter<'a, Job>;

    fn into_iter(self) -> Self::IntoIter {
        self.jobs.iter()
    }
}

impl IntoIterator for Listing {
    type Item = Job;
    type IntoIter = std::vec::IntoIter<Job>;

    fn into_iter(self) -> Self::IntoIter {
        self.jobs.into_iter()
    }
}

/// A job store kept in a single JSON file.
///
/// Every operation takes an exclusive `flock` on `<path>.lock`, loads the whole
/// ledger, applies the change, atomically replaces the queue file and unlocks.
///
///    ```rust
///         let queue = Queue::builder()
///             .path(dir.join("queue.json"))
///             .lock_params(LockParams::with_timeout(Duration::from_secs(5)))
///             .build();
///
///         let id = queue.enqueue(new_job)?;
///     ```
///
#[derive(Clone, Debug, TypedBuilder)]
pub struct Queue {
    #[builder(setter(into))]
    pub path: PathBuf,
    #[builder(default, setter(into))]
    pub lock_params: LockParams,
    /// Replace an unreadable store with an empty ledger instead of failing.
    #[builder(default = true)]
    pub recover_corrupt: bool,
}

impl Queueable for Queue {
    fn enqueue(&self, new_job: NewJob) -> Result<JobId, QueueError> {
        let id = self.transaction(|ledger| Ok(ledger.enqueue(new_job)))?;

        info!("Queued job {} in {}", id, self.path.display());

        Ok(id)
    }

    fn pop(&self) -> Result<Option<Job>, QueueError> {
        self.transaction(|ledger| Ok(ledger.pop()))
    }

    fn remove(&self, id: JobId) -> Result<usize, QueueError> {
        let removed = self.transaction(|ledger| Ok(ledger.remove(id).map_or(0, |_| 1)))?;

        if removed > 0 {
            info!("Removed job {} from {}", id, self.path.display());
        }

        Ok(removed)
    }

    fn clear(&self) -> Result<usize, QueueError> {
        self.transaction(|ledger| Ok(ledger.clear()))
    }

    fn list(&self) -> Result<Listing, QueueError> {
        self.read(|ledger| Listing {
            jobs: ledger.jobs().cloned().collect(),
        })
    }

    fn find(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.read(|ledger| ledger.get(id).cloned())
    }

    fn count(&self) -> Result<usize, QueueError> {
        self.read(|ledger| ledger.len())
    }
}

impl Queue {
    /// Runs `change` against the stored ledger while holding the lock and writes the
    /// result back before unlocking. Nothing is written when `change` fails.
    pub fn transaction<T, F>(&self, change: F) -> Result<T, QueueError>
    where
        F: FnOnce(&mut Ledger) -> Result<T, QueueError>,
    {
        let _locked = LockedFile::acquire(&self.lock_path(), &self.lock_params)?;
        let mut ledger = self.load()?;

        let result = change(&mut ledger)?;

        self.save(&ledger)?;

        Ok(result)
    }

    /// Same locking as [`Queue::transaction`], but the ledger is not written back.
    pub fn read<T, F>(&self, inspect: F) -> Result<T, QueueError>
    where
        F: FnOnce(&Ledger) -> T,
    {
        let _locked = LockedFile::acquire(&self.lock_path(), &self.lock_params)?;
        let ledger = self.load()?;

        Ok(inspect(&ledger))
    }

    /// The file every transaction locks. The queue file itself is replaced on every
    /// write, so it can't carry the lock.
    pub fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(suffix);

        self.path.with_file_name(name)
    }

    fn load(&self) -> Result<Ledger, QueueError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Ledger::new()),
            Err(error) if error.kind() == ErrorKind::InvalidData => {
                return self.recover(error.to_string())
            }
            Err(error) => return Err(error.into()),
        };

        if contents.trim().is_empty() {
            return Ok(Ledger::new());
        }

        let parsed = serde_json::from_str::<Ledger>(&contents)
            .map_err(|error| error.to_string())
            .and_then(|ledger| {
                ledger
                    .validate()
                    .map(|_| ledger)
                    .map_err(|error: LedgerError| error.to_string())
            });

        match parsed {
            Ok(ledger) => Ok(ledger),
            Err(reason) => self.recover(reason),
        }
    }

    /// Moves an unreadable queue file out of the way, keeping it next to the queue
    /// as `<name>.corrupt-<timestamp>`, and starts over from an empty ledger.
    fn recover(&self, reason: String) -> Result<Ledger, QueueError> {
        if !self.recover_corrupt {
            return Err(QueueError::CorruptStore {
                path: self.path.clone(),
                reason,
            });
        }

        let backup = self.sibling(&format!(
            ".corrupt-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
        ));

        fs::rename(&self.path, &backup)?;

        warn!(
            "Moved unreadable queue file {} to {} and started from an empty queue: {}",
            self.path.display(),
            backup.display(),
            reason
        );

        Ok(Ledger::new())
    }

    /// Writes the ledger to a temporary file and renames it over the queue file, so
    /// the queue file always holds either the old or the new ledger in full.
    fn save(&self, ledger: &Ledger) -> Result<(), QueueError> {
        let contents = serde_json::to_vec(ledger)?;
        let temporary = self.sibling(".tmp");

        let mut file = File::create(&temporary)?;
        file.write_all(&contents)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temporary, &self.path)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            sync_dir(parent)?;
        }

        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), QueueError> {
    File::open(dir)?.sync_all()?;

    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), QueueError> {
    Ok(())
}
