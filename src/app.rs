//! Application wiring: tailers feed the bundler, the bundler feeds the sink.

use futures::future::join_all;
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bundler::{AddError, Bundler};
use crate::cli::Opts;
use crate::config::{AgentConfig, ConfigError};
use crate::event::ByteSizeOf;
use crate::sinks::console;
use crate::sources::file::{FileTailer, TailError};

#[derive(Debug, Snafu)]
pub enum AppError {
    #[snafu(display("{source}"), context(false))]
    Config { source: ConfigError },
    #[snafu(display("{source}"), context(false))]
    Tail { source: TailError },
}

pub async fn run(opts: Opts) -> Result<(), AppError> {
    let mut config = match &opts.config {
        Some(path) => AgentConfig::from_path(path)?,
        None => AgentConfig::default(),
    };
    config.files.extend(opts.files.iter().cloned());
    if config.files.is_empty() {
        return Err(ConfigError::NoFiles.into());
    }

    let settings = config.bundle.to_settings()?;
    let bundler = Bundler::new(settings, console(config.sink.encoding));
    let cancel = CancellationToken::new();

    let (tx, mut rx) = mpsc::channel(1024);
    let mut tailers = Vec::new();
    for path in &config.files {
        let tailer = FileTailer::open(config.tailer_config(path.clone())).await?;
        info!(message = "Tailing file.", path = %path.display());
        tailers.push(tokio::spawn(tailer.run(tx.clone(), cancel.clone())));
    }
    // Once every tailer is done the channel closes and the forward loop ends.
    drop(tx);

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(message = "Shutdown signal received.");
            signal_cancel.cancel();
        }
    });

    while let Some(line) = rx.recv().await {
        let size = line.size_of();
        match bundler.add(line, &cancel).await {
            Ok(()) => {}
            Err(AddError::Oversize) => {
                warn!(message = "Dropping oversize line.", size);
            }
            Err(AddError::Cancelled) => break,
            Err(AddError::Overflow) => {
                unreachable!("blocking add does not report overflow")
            }
        }
    }

    cancel.cancel();
    for result in join_all(tailers).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => error!(message = "Tailer failed.", %error),
            Err(error) => error!(message = "Tailer task panicked.", %error),
        }
    }

    bundler.flush().await;
    info!(message = "Flushed remaining bundles; exiting.");
    Ok(())
}
