use chrono::Local;
use clap::Parser;
use clap::Subcommand;
use idleq::config::Paths;
use idleq::Admission;
use idleq::AdmissionController;
use idleq::Config;
use idleq::IdleqError;
use idleq::JobId;
use idleq::NewJob;
use idleq::Queue;
use idleq::Queueable;
use idleq::ShellLauncher;
use idleq::SystemMetrics;
use idleq::Thresholds;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "idleq",
    version,
    about = "Queue shell commands and run them one at a time when the machine is idle"
)]
struct Cli {
    /// Directory holding the queue file and the per-host config
    #[arg(long, global = true, env = "IDLEQ_DIR")]
    dir: Option<PathBuf>,
    /// Override the load average limit for this invocation
    #[arg(long, global = true)]
    load_limit: Option<f64>,
    /// Override the used memory limit (GB) for this invocation
    #[arg(long, global = true)]
    mem_limit: Option<f64>,
    /// Seconds to wait for the queue lock before giving up
    #[arg(long, global = true)]
    lock_timeout: Option<u64>,
    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    /// Running `idleq` with no subcommand shows the status.
    fn subcommand(&self) -> Command {
        self.command.clone().unwrap_or(Command::Status)
    }
}

#[derive(Clone, Debug, PartialEq, Subcommand)]
enum Command {
    /// Queue a command, run later from the current directory
    Add {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Start the next queued job if the machine is idle
    Update,
    /// Remove queued jobs
    Delete {
        #[arg(required = true)]
        ids: Vec<u64>,
    },
    /// Show the queued jobs
    List,
    /// Show the queue length and the idle verdict
    Status,
    /// Show the effective configuration
    Config {
        /// Write the effective configuration to the per-host config file
        #[arg(long)]
        save: bool,
    },
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("idleq: {error}");

            ExitCode::from(error.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<(), IdleqError> {
    let paths = Paths::resolve(cli.dir.clone())?;
    let config = effective_config(&cli, &paths)?;

    let queue = Queue::builder()
        .path(paths.store())
        .lock_params(config.lock_params())
        .recover_corrupt(config.recover_corrupt_store)
        .build();

    match cli.subcommand() {
        Command::Add { command } => {
            let working_directory =
                std::env::current_dir().map_err(IdleqError::WorkingDirectory)?;

            println!("{}", add(&queue, &config, working_directory, &command)?);

            Ok(())
        }
        Command::Update => update(queue, &config),
        Command::Delete { ids } => {
            println!("removed {}", delete(&queue, &ids)?);

            Ok(())
        }
        Command::List => list(&queue),
        Command::Status => status(queue, &config),
        Command::Config { save } => show_config(&config, &paths, save),
    }
}

fn effective_config(cli: &Cli, paths: &Paths) -> Result<Config, IdleqError> {
    let mut config = Config::load(&paths.config())?;

    if let Some(load_limit) = cli.load_limit {
        config.load_limit = load_limit;
    }

    if let Some(mem_limit) = cli.mem_limit {
        config.mem_limit = mem_limit;
    }

    if let Some(lock_timeout) = cli.lock_timeout {
        config.lock_timeout_secs = lock_timeout;
    }

    config.validate()?;

    Ok(config)
}

/// Queues `words` joined by spaces as one shell command run from `working_directory`.
fn add(
    queue: &impl Queueable,
    config: &Config,
    working_directory: PathBuf,
    words: &[String],
) -> Result<JobId, IdleqError> {
    let new_job = NewJob::builder()
        .command(words.join(" "))
        .working_directory(working_directory)
        .environment(config.snapshot_environment())
        .build();

    Ok(queue.enqueue(new_job)?)
}

fn controller(
    queue: Queue,
    config: &Config,
) -> AdmissionController<Queue, ShellLauncher, SystemMetrics> {
    AdmissionController::builder()
        .queue(queue)
        .launcher(ShellLauncher::default())
        .metrics(SystemMetrics)
        .thresholds(config)
        .build()
}

fn update(queue: Queue, config: &Config) -> Result<(), IdleqError> {
    if let Admission::Launched { job, .. } = controller(queue, config).update()? {
        println!("launched {}: {}", job.id, job.command);
    }

    Ok(())
}

/// Returns how many of `ids` were queued. Unknown ids are skipped.
fn delete(queue: &impl Queueable, ids: &[u64]) -> Result<usize, IdleqError> {
    let mut removed = 0;

    for id in ids {
        removed += queue.remove(JobId(*id))?;
    }

    Ok(removed)
}

fn list(queue: &Queue) -> Result<(), IdleqError> {
    for job in &queue.list()? {
        let created_at = job
            .created_at
            .map(|at| {
                at.with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:>5}  {}  {}  {}",
            job.id,
            created_at,
            job.working_directory.display(),
            job.command
        );
    }

    Ok(())
}

fn status(queue: Queue, config: &Config) -> Result<(), IdleqError> {
    println!("queued jobs: {}", queue.count()?);

    let controller = controller(queue, config);
    let signals = controller.signals()?;
    let thresholds = Thresholds::from(config);

    println!(
        "memory:      {:.2} GB used, limit {:.2} GB",
        signals.used_memory_gb, thresholds.mem_limit
    );
    println!(
        "load:        {:.2} {:.2} {:.2}, limit {:.2}",
        signals.load.one, signals.load.five, signals.load.fifteen, thresholds.load_limit
    );
    println!(
        "state:       {}",
        if thresholds.is_idle(&signals) {
            "idle"
        } else {
            "busy"
        }
    );

    Ok(())
}

fn show_config(config: &Config, paths: &Paths, save: bool) -> Result<(), IdleqError> {
    if save {
        config.save(&paths.config())?;
        println!("saved {}", paths.config().display());
    }

    println!("{}", config.render()?);

    Ok(())
}
