use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use stomp_input::{ConnectorError, Event, StompInput};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use super::args::Cli;
use super::exit_codes;

/// Install the global subscriber. `RUST_LOG` wins over `--debug`.
pub fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

/// Run the connector, printing every event to stdout as one JSON line.
pub async fn run(cli: &Cli) -> Result<(), (String, u8)> {
    let settings = cli
        .settings()
        .map_err(|e| (format!("configuration error: {}", e), exit_codes::CONFIG_ERROR))?;
    init_logging(settings.debug);

    let mut input: StompInput = StompInput::new(settings)
        .map_err(|e| (format!("configuration error: {}", e), exit_codes::CONFIG_ERROR))?;
    input
        .register()
        .map_err(|e| (format!("configuration error: {}", e), exit_codes::CONFIG_ERROR))?;
    let input = Arc::new(input);

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let printer = tokio::spawn(async move {
        let stdout = io::stdout();
        while let Some(event) = rx.recv().await {
            let mut out = stdout.lock();
            if writeln!(out, "{}", event.to_json()).and_then(|_| out.flush()).is_err() {
                break;
            }
        }
    });

    let stopper = input.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            stopper.stop().await;
        }
    });

    let result = input.start(tx).await;
    // Giving up on the broker ends the run like a stop does.
    if let Some(failure) = input.last_failure() {
        info!(reason = %failure, "connector stopped without a connection");
    }
    drop(input);
    // The printer ends once every sender is gone; give queued events a
    // moment to drain.
    match tokio::time::timeout(Duration::from_secs(2), printer).await {
        Ok(Err(e)) => warn!(error = %e, "printer task failed"),
        Ok(Ok(())) => {}
        Err(_) => warn!("timed out flushing events"),
    }

    result.map_err(|e| match e {
        ConnectorError::Config(_) => (e.to_string(), exit_codes::CONFIG_ERROR),
        _ => (e.to_string(), exit_codes::USAGE_ERROR),
    })
}
