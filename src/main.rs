use std::sync::Arc;

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use tracing::{info, warn};

use spela::cli::Cli;
use spela::client;
use spela::config::Config;
use spela::system::System;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install().unwrap();

    let options = Cli::parse();
    setup_tracing(options.verbose);

    let config = match &options.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if options.kill {
        return kill_running_instance(&config);
    }

    if !options.no_daemon {
        // daemonization is intentionally not implemented; the daemon always
        // stays in the foreground
        info!("running in the foreground");
    }

    if options.create_db
        && let Err(error) = std::fs::remove_file(config.db_file.as_std_path())
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!("could not remove {}: {error}", config.db_file);
    }

    write_pid_file(&config)?;

    let config = Arc::new(config);
    let system = System::start((*config).clone()).wrap_err("Could not start the server")?;
    System::start_auto_update(&system).await;

    {
        let mut sys = system.lock().await;
        if options.create_db || sys.db.song_count() == 0 {
            sys.enqueue_update(None, options.create_db);
        }
    }

    let (kill_tx, mut kill_rx) = tokio::sync::mpsc::unbounded_channel();
    let server = tokio::spawn(client::run_server(
        Arc::clone(&system),
        Arc::clone(&config),
        kill_tx,
    ));

    tokio::select! {
        _ = kill_rx.recv() => info!("kill command received"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = terminate_signal() => info!("terminated"),
        result = server => {
            result
                .wrap_err("server task failed")?
                .wrap_err("could not serve clients")?;
        }
    }

    system.lock().await.shutdown();
    remove_pid_file(&config);
    Ok(())
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await
}

fn write_pid_file(config: &Config) -> Result<()> {
    if let Some(path) = &config.pid_file {
        std::fs::write(path.as_std_path(), format!("{}\n", std::process::id()))
            .wrap_err("Could not write pid file")
            .wrap_err_with(|| format!("path: {path}"))?;
    }
    Ok(())
}

fn remove_pid_file(config: &Config) {
    if let Some(path) = &config.pid_file {
        let _ = std::fs::remove_file(path.as_std_path());
    }
}

#[cfg(unix)]
fn kill_running_instance(config: &Config) -> Result<()> {
    use color_eyre::eyre::{bail, eyre};

    let path = config
        .pid_file
        .as_ref()
        .ok_or_else(|| eyre!("no pid_file configured, cannot --kill"))?;
    let pid: i32 = std::fs::read_to_string(path.as_std_path())
        .wrap_err("Could not read pid file")
        .wrap_err_with(|| format!("path: {path}"))?
        .trim()
        .parse()
        .wrap_err("pid file does not contain a pid")?;

    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        bail!("could not signal process {pid}");
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_running_instance(_config: &Config) -> Result<()> {
    color_eyre::eyre::bail!("--kill is only supported on unix");
}

fn setup_tracing(verbose: bool) {
    use tracing_subscriber::filter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let default = if verbose { "spela=debug" } else { "spela=info" };
    let filter = filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter::EnvFilter::new(default));
    let fmt = fmt::layer().with_line_number(true);

    let _ignore_err = tracing_subscriber::registry()
        .with(fmt)
        .with(filter)
        .try_init();
}
