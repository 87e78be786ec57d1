mod config;
mod reporter;
mod serve;
mod signals;
mod task;
mod timer;

use clap::Parser;
use config::{ConfigError, FileConfig, Overrides, Settings};
use reporter::{ReportMode, Reporter};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use task::TaskSpec;
use timer::WatchdogTimer;
use tokio::sync::{mpsc, oneshot};

/// A dead man's switch: runs a task when a timer expires, unless the timer
/// is reset over HTTP first.
#[derive(Parser, Debug)]
#[command(name = "watchdog", version, about)]
pub struct Cli {
    /// Command to execute when the timer expires (required)
    #[arg(long)]
    task: Option<String>,

    /// Time to wait before running the task, e.g. 30s or 10h5m46s (required)
    #[arg(long)]
    time: Option<String>,

    /// TCP port to listen on [default: 8080]
    #[arg(long)]
    port: Option<u16>,

    /// Listen on localhost only [default: true]
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    local: Option<bool>,

    /// No browser output, answer 404 instead
    #[arg(long)]
    stealth: bool,

    /// Run the timer once only, then exit
    #[arg(long)]
    onetime: bool,

    /// URL path that resets the timer [default: /reset/]
    #[arg(long)]
    reset_url: Option<String>,

    /// URL path that restarts an expired timer [default: /restart/]
    #[arg(long)]
    restart_url: Option<String>,

    /// URL to redirect to after a reset or restart
    #[arg(long)]
    redir_url: Option<String>,

    /// Optional TOML config file; command-line flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug logging (timer resets, stale alarms)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            task: self.task.clone(),
            time: self.time.clone(),
            port: self.port,
            local: self.local,
            stealth: self.stealth,
            onetime: self.onetime,
            reset_url: self.reset_url.clone(),
            restart_url: self.restart_url.clone(),
            redir_url: self.redir_url.clone(),
        }
    }

    fn settings(&self) -> Result<Settings, ConfigError> {
        let file = match &self.config {
            Some(path) => config::load_file(path)?,
            None => FileConfig::default(),
        };
        Settings::resolve(self.overrides(), file)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "watchdog=debug,tower_http=debug"
    } else {
        "watchdog=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let settings = match cli.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {e}\n\nRun with --help for usage.");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        println!("{settings:#?}");
        println!("Dry run mode, config validated, not running.");
        return ExitCode::SUCCESS;
    }

    run(settings).await
}

/// How a run ended, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunStatus {
    Success,
    Failure,
}

impl From<RunStatus> for ExitCode {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Success => ExitCode::SUCCESS,
            RunStatus::Failure => ExitCode::FAILURE,
        }
    }
}

async fn run(settings: Settings) -> ExitCode {
    let task = match TaskSpec::new(settings.task.clone()) {
        Ok(task) => task,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let listener = match tokio::net::TcpListener::bind(settings.listen_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %settings.listen_addr(), "failed to bind listener: {e}");
            return ExitCode::FAILURE;
        }
    };

    watch(&settings, task, listener).await.into()
}

/// Arm the timer and serve until a signal arrives or, in one-shot mode,
/// until the single outcome has been reported.
async fn watch(
    settings: &Settings,
    task: TaskSpec,
    listener: tokio::net::TcpListener,
) -> RunStatus {
    let mode = if settings.onetime {
        ReportMode::OneShot
    } else {
        ReportMode::Recurring
    };
    let (outcome_tx, outcome_rx) = mpsc::channel(1);
    let (finished_tx, finished_rx) = oneshot::channel::<()>();
    let mut reporter = tokio::spawn(async move {
        let summary = Reporter::new(outcome_rx, mode).run().await;
        let _ = finished_tx.send(());
        summary
    });

    let timer = Arc::new(WatchdogTimer::new(task, settings.deadline, outcome_tx));
    timer.arm().await;

    let app = serve::router(Arc::clone(&timer), serve::HttpSettings::from(settings));
    let shutdown = async move {
        tokio::select! {
            _ = signals::shutdown() => {}
            _ = finished_rx => {}
        }
    };
    if let Err(e) = serve::run(listener, app, shutdown).await {
        tracing::error!("server error: {e}");
        return RunStatus::Failure;
    }

    // Stop producing, then let in-flight outcomes drain before exiting.
    timer.stop().await;
    drop(timer);
    let summary = match tokio::time::timeout(settings.shutdown_grace, &mut reporter).await {
        Ok(Ok(summary)) => summary,
        Ok(Err(e)) => {
            tracing::error!("reporter task failed: {e}");
            return RunStatus::Failure;
        }
        Err(_) => {
            tracing::warn!(
                grace_secs = settings.shutdown_grace.as_secs(),
                "outcome still pending at shutdown, exiting without it"
            );
            reporter.abort();
            return RunStatus::Success;
        }
    };

    match (mode, summary.last) {
        (ReportMode::OneShot, Some(record)) if record.is_failure() => RunStatus::Failure,
        _ => RunStatus::Success,
    }
}
