mod cli;
mod error;
mod writer;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::StreamExt;
use rand::seq::SliceRandom;
use secrecy::SecretString;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mdsweep_api::{Credentials, Endpoint, Error as ApiError, TlsMode, TransportConfig};
use mdsweep_core::{
    BackupTarget, ControllerFactory, CoreError, ExecMode, FilterChain, SessionFactory,
    SweepOptions, Task, TaskPool, backup, discover,
};

use crate::cli::Cli;
use crate::error::CliError;
use crate::writer::SweepWriter;

/// What runs when no command is given: the device's software version.
const DEFAULT_COMMAND: &str = "show version | $._data[0]";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn session_error(host: &str, err: ApiError) -> CliError {
    match err {
        e @ ApiError::Authentication { .. } => CliError::AuthFailed {
            target: host.to_owned(),
            message: e.to_string(),
        },
        e @ ApiError::Transport(_) => CliError::ConnectionFailed {
            target: host.to_owned(),
            message: e.to_string(),
        },
        other => CliError::from(CoreError::from(other)),
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    // Everything below needs credentials; ask before any parsing output
    // interleaves with the prompt.
    let password = rpassword::prompt_password("Password: ")?;
    let credentials = Credentials {
        username: cli.username.clone(),
        password: SecretString::from(password),
    };

    let transport = TransportConfig {
        tls: if cli.verify {
            TlsMode::System
        } else {
            TlsMode::DangerAcceptInvalid
        },
        timeout: Duration::from_secs(cli.timeout.max(1)),
    };
    let factory = ControllerFactory::new(credentials, Endpoint::default(), &transport)
        .map_err(|e| session_error(&cli.host, e))?;

    // Backup replaces the sweep entirely.
    if let Some(url) = &cli.backup {
        return run_backup(&cli, &factory, url).await;
    }

    // Build the task list before any network I/O so syntax errors abort
    // the whole run immediately.
    let spec = if cli.command.is_empty() {
        DEFAULT_COMMAND.to_owned()
    } else {
        cli.command.join(" ")
    };
    let mode = if cli.shell {
        ExecMode::Shell
    } else {
        ExecMode::Api
    };
    let tasks: Arc<[Task]> = Task::parse_list(&spec, mode)?.into();
    let filter = cli
        .filter
        .as_deref()
        .map(FilterChain::compile)
        .transpose()?;

    // Fleet discovery through one session against the manager.
    info!("collecting the device list");
    let mut session = factory
        .session(&cli.host)
        .map_err(|e| session_error(&cli.host, e))?;
    let discovered = discover(&mut session, filter.as_ref()).await;
    if let Err(e) = session.close().await {
        warn!(error = %e, "closing discovery session failed");
    }
    let mut targets = match discovered {
        Ok(targets) => targets,
        Err(CoreError::Session(e)) => return Err(session_error(&cli.host, e)),
        Err(source) => return Err(CliError::Discovery { source }),
    };

    if let Some(limit) = cli.limit {
        if limit < targets.len() {
            targets.shuffle(&mut rand::rng());
            targets.truncate(limit);
        }
    }
    info!(count = targets.len(), "device list collected");
    if targets.is_empty() {
        warn!("no devices matched; nothing to do");
        return Ok(());
    }

    // One worker per device, iterations bounded by the shared gate.
    let options = SweepOptions {
        limit: cli.tasks.clamp(1, targets.len()),
        delay: cli.delay.filter(|&d| d > 0).map(Duration::from_secs),
        loop_interval: cli.interval.filter(|&i| i > 0).map(Duration::from_secs),
    };
    let looping = options.loop_interval.is_some();
    let pool = Arc::new(TaskPool::new(factory, options));

    if looping {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; letting in-flight iterations finish");
                pool.cancel();
            }
        });
    }

    let writer = SweepWriter::new(cli.output.clone());
    let streams: Vec<_> = targets
        .iter()
        .map(|target| pool.push(target.clone(), Arc::clone(&tasks), None))
        .collect();

    // Results arrive in completion order across devices; each stream ends
    // when its worker does, so the merge drains exactly one sweep.
    let mut merged = futures_util::stream::select_all(streams);
    while let Some(result) = merged.next().await {
        writer.write(&result)?;
    }
    pool.close().await;
    Ok(())
}

async fn run_backup(cli: &Cli, factory: &ControllerFactory, url: &url::Url) -> Result<(), CliError> {
    let mut destination = BackupTarget::parse(url)?;
    if destination.password.is_none() {
        let pass = rpassword::prompt_password("Password for backup: ")?;
        destination.password = Some(SecretString::from(pass));
    }

    let mut session = factory
        .session(&cli.host)
        .map_err(|e| session_error(&cli.host, e))?;
    let outcome = backup::run_backup(&mut session, &destination).await;
    if let Err(e) = session.close().await {
        warn!(error = %e, "closing backup session failed");
    }
    match outcome {
        Ok(()) => {
            info!("backup uploaded");
            Ok(())
        }
        Err(CoreError::Session(e)) => Err(session_error(&cli.host, e)),
        Err(source) => Err(CliError::Backup { source }),
    }
}
