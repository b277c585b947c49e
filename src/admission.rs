use crate::error::IdleqError;
use crate::launcher::Launcher;
use crate::metrics::MetricsSource;
use crate::metrics::Signals;
use crate::queue::Queueable;
use crate::Config;
use crate::Job;
use log::debug;
use log::error;
use log::info;
use typed_builder::TypedBuilder;

/// The limits a machine has to be under to count as idle.
#[derive(Clone, Copy, Debug, PartialEq, TypedBuilder)]
pub struct Thresholds {
    pub load_limit: f64,
    /// gigabytes
    pub mem_limit: f64,
}

impl From<&Config> for Thresholds {
    fn from(config: &Config) -> Self {
        Self {
            load_limit: config.load_limit,
            mem_limit: config.mem_limit,
        }
    }
}

impl Thresholds {
    /// Memory and load are below their limits and the load is not climbing.
    pub fn is_idle(&self, signals: &Signals) -> bool {
        signals.used_memory_gb < self.mem_limit
            && signals.load.one < self.load_limit
            && signals.load.one <= signals.load.five
    }
}

/// What a single `update` did.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The machine is busy, the queue was not touched.
    Busy(Signals),
    /// The machine is idle but nothing is queued.
    Empty(Signals),
    /// One job left the queue and was started.
    Launched { job: Job, pid: u32, signals: Signals },
}

/// Releases at most one queued job per call to [`AdmissionController::update`],
/// and only while the machine is idle.
#[derive(TypedBuilder)]
pub struct AdmissionController<BQueue, BLauncher, BMetrics>
where
    BQueue: Queueable,
    BLauncher: Launcher,
    BMetrics: MetricsSource,
{
    pub queue: BQueue,
    pub launcher: BLauncher,
    pub metrics: BMetrics,
    #[builder(setter(into))]
    pub thresholds: Thresholds,
}

impl<BQueue, BLauncher, BMetrics> AdmissionController<BQueue, BLauncher, BMetrics>
where
    BQueue: Queueable,
    BLauncher: Launcher,
    BMetrics: MetricsSource,
{
    pub fn signals(&self) -> Result<Signals, IdleqError> {
        Ok(self.metrics.signals()?)
    }

    pub fn update(&self) -> Result<Admission, IdleqError> {
        let signals = self.signals()?;

        if !self.thresholds.is_idle(&signals) {
            debug!(
                "Busy: memory {:.2}/{:.2} GB, load {:.2} (5 min {:.2}), limit {:.2}",
                signals.used_memory_gb,
                self.thresholds.mem_limit,
                signals.load.one,
                signals.load.five,
                self.thresholds.load_limit
            );

            return Ok(Admission::Busy(signals));
        }

        let job = match self.queue.pop()? {
            Some(job) => job,
            None => {
                debug!("Idle, but the queue is empty");

                return Ok(Admission::Empty(signals));
            }
        };

        match self.launcher.launch(&job) {
            Ok(pid) => {
                info!(
                    "Launched job {} (pid {}) in {}: {}",
                    job.id,
                    pid,
                    job.working_directory.display(),
                    job.command
                );

                Ok(Admission::Launched { job, pid, signals })
            }
            Err(source) => {
                error!(
                    "Job {} left the queue but could not be started: {}",
                    job.id, source
                );

                Err(IdleqError::LaunchFailed {
                    id: job.id,
                    command: job.command,
                    source,
                })
            }
        }
    }
}
