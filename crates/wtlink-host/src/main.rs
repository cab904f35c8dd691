//! wtlink-host: run the bridge until Ctrl-C or the worker goes away.
//!
//! The worker is launched separately and connects to the loopback port.

use std::process;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use wtlink::{Bridge, BridgeConfig};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Before any config parsing, which warns about invalid values.
    init_tracing();

    let config = match load_config(&args, |key| std::env::var(key).ok()) {
        Ok(config) => config,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: wtlink-host [--port <port>] [--accept-timeout <secs>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --port <port>             Loopback port to listen on [default: 7000]");
            eprintln!("  --accept-timeout <secs>   Give up if no worker connects in time (0 waits forever)");
            eprintln!();
            eprintln!("Environment:");
            eprintln!("  WTLINK_PORT, WTLINK_ACCEPT_TIMEOUT_SECS, WTLINK_INBOUND_CAPACITY");
            eprintln!("  WTLINK_LOG=debug|info|warn|error, RUST_LOG, LOG_FORMAT=json");
            process::exit(if msg.is_empty() { 0 } else { 2 });
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        tracing::error!(error = format!("{e:#}"), "Host exiting");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("WTLINK_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("wtlink={level},wtlink_host={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

/// Environment first, flags on top.
fn load_config(
    args: &[String],
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, String> {
    parse_args(args, BridgeConfig::from_lookup(lookup))
}

fn parse_args(args: &[String], mut config: BridgeConfig) -> Result<BridgeConfig, String> {
    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                let raw = args.get(i).ok_or("--port requires a value")?;
                config.port = raw
                    .parse()
                    .map_err(|_| format!("invalid port '{raw}'"))?;
            }
            "--accept-timeout" => {
                i += 1;
                let raw = args.get(i).ok_or("--accept-timeout requires a value")?;
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid accept timeout '{raw}'"))?;
                config.accept_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(config)
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let (bridge, mut inbound) = Bridge::init(config)
        .await
        .context("failed to start bridge")?;
    tracing::info!(local_addr = %bridge.local_addr(), "Waiting for transport worker");

    let worker = tokio::select! {
        worker = bridge.wait_for_worker() => worker.context("worker did not connect")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted before worker connected");
            bridge.shutdown().await;
            return Ok(());
        }
    };
    tracing::info!(%worker, "Transport worker connected");

    bridge
        .start_transport()
        .await
        .context("failed to start transport")?;

    loop {
        tokio::select! {
            Some(payload) = inbound.recv() => {
                tracing::info!(
                    connection_id = %payload.connection_id,
                    body_len = payload.body.len(),
                    "Payload from remote connection"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                if let Err(e) = bridge.stop_transport().await {
                    tracing::warn!(error = %e, "Failed to stop transport");
                }
                let exit = bridge.shutdown().await;
                tracing::info!(?exit, connections = bridge.connections().len(), "Bridge stopped");
                return Ok(());
            }
            _ = bridge.closed() => {
                let exit = bridge.shutdown().await;
                anyhow::bail!("worker session closed: {exit:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("wtlink-host")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn flags_override_config() {
        let config = parse_args(
            &args(&["--port", "7100", "--accept-timeout", "15"]),
            BridgeConfig::default(),
        )
        .unwrap();
        assert_eq!(config.port, 7100);
        assert_eq!(config.accept_timeout, Some(Duration::from_secs(15)));
    }

    #[test]
    fn zero_timeout_waits_forever() {
        let base = BridgeConfig::default().with_accept_timeout(Duration::from_secs(3));
        let config = parse_args(&args(&["--accept-timeout", "0"]), base).unwrap();
        assert!(config.accept_timeout.is_none());
    }

    #[test]
    fn bad_arguments_are_rejected() {
        let base = BridgeConfig::default;
        assert!(parse_args(&args(&["--port"]), base()).is_err());
        assert!(parse_args(&args(&["--port", "abc"]), base()).is_err());
        assert!(parse_args(&args(&["extra"]), base()).is_err());
        assert_eq!(parse_args(&args(&["-h"]), base()), Err(String::new()));
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn invalid_env_value_is_logged_and_flag_still_applies() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let config = tracing::subscriber::with_default(subscriber, || {
            load_config(&args(&["--accept-timeout", "4"]), |key| {
                (key == "WTLINK_PORT").then(|| "not-a-port".to_string())
            })
        })
        .unwrap();

        assert_eq!(config.port, wtlink::config::DEFAULT_PORT);
        assert_eq!(config.accept_timeout, Some(Duration::from_secs(4)));

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("Ignoring invalid configuration value"), "logs: {logs}");
        assert!(logs.contains("WTLINK_PORT"), "logs: {logs}");
    }
}
