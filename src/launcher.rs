use crate::Job;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("The working directory {0} does not exist")]
    MissingDirectory(PathBuf),
    #[error("Failed to start `{command}` in {}: {source}", working_directory.display())]
    Spawn {
        command: String,
        working_directory: PathBuf,
        source: io::Error,
    },
}

/// Starts a released job. Implementations must not wait for the job to finish.
pub trait Launcher {
    /// Returns the id of the started process.
    fn launch(&self, job: &Job) -> Result<u32, LaunchError>;
}

/// Runs the job's command through a shell, detached from the caller's stdio.
///
/// The stored environment is layered over the environment of the invoking process,
/// so stored values win over inherited ones.
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    pub shell: PathBuf,
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl Launcher for ShellLauncher {
    fn launch(&self, job: &Job) -> Result<u32, LaunchError> {
        if !job.working_directory.is_dir() {
            return Err(LaunchError::MissingDirectory(job.working_directory.clone()));
        }

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&job.command)
            .current_dir(&job.working_directory)
            .envs(&job.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                command: job.command.clone(),
                working_directory: job.working_directory.clone(),
                source,
            })?;

        Ok(child.id())
    }
}
