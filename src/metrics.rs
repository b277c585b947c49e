use sysinfo::System;
use thiserror::Error;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("System metrics are unavailable: {0}")]
    Unavailable(String),
}

/// Load averages over the last 1, 5 and 15 minutes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAverages {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// The two resource signals the admission decision is made from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signals {
    pub used_memory_gb: f64,
    pub load: LoadAverages,
}

/// Where the current machine state comes from.
pub trait MetricsSource {
    /// Total minus free memory, in gigabytes.
    fn used_memory_gb(&self) -> Result<f64, MetricsError>;

    fn load_averages(&self) -> Result<LoadAverages, MetricsError>;

    fn signals(&self) -> Result<Signals, MetricsError> {
        Ok(Signals {
            used_memory_gb: self.used_memory_gb()?,
            load: self.load_averages()?,
        })
    }
}

/// Reads memory through `sysinfo` and load through `getloadavg(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMetrics;

impl MetricsSource for SystemMetrics {
    fn used_memory_gb(&self) -> Result<f64, MetricsError> {
        let mut system = System::new();
        system.refresh_memory();

        let total = system.total_memory();

        if total == 0 {
            return Err(MetricsError::Unavailable(
                "the operating system reported no memory".to_string(),
            ));
        }

        let used = total.saturating_sub(system.free_memory());

        Ok(used as f64 / BYTES_PER_GB)
    }

    fn load_averages(&self) -> Result<LoadAverages, MetricsError> {
        let mut loads = [0.0_f64; 3];

        let samples = read_load_averages(&mut loads);

        load_averages_from(samples, loads)
    }
}

#[cfg(unix)]
fn read_load_averages(loads: &mut [f64; 3]) -> i32 {
    unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) }
}

#[cfg(not(unix))]
fn read_load_averages(_loads: &mut [f64; 3]) -> i32 {
    -1
}

/// `samples` is the return value of `getloadavg`: the number of averages that were
/// filled in, or -1 when the system could not provide them.
fn load_averages_from(samples: i32, loads: [f64; 3]) -> Result<LoadAverages, MetricsError> {
    if samples < 3 {
        return Err(MetricsError::Unavailable(format!(
            "getloadavg returned {samples} of 3 load averages"
        )));
    }

    if loads.iter().any(|value| !value.is_finite() || *value < 0.0) {
        return Err(MetricsError::Unavailable(format!(
            "invalid load averages {loads:?}"
        )));
    }

    Ok(LoadAverages {
        one: loads[0],
        five: loads[1],
        fifteen: loads[2],
    })
}
