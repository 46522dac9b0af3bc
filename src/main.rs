//! # beacon
//!
//! Command-line front end for the beacon outbox: track events, flush the
//! queue, and inspect delivery state.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use beacon_core::config::{default_config_path, load_config_from_path};
use beacon_core::{EventBuilder, FieldCipher, Properties};
use beacon_pipeline::{Beacon, BeaconDeps, BeaconError, UploadError};
use beacon_telemetry::{init_telemetry, TelemetryConfig};

const IN_FLIGHT_POLL: Duration = Duration::from_millis(100);

/// Durable telemetry outbox.
#[derive(Parser, Debug)]
#[command(name = "beacon", about = "Durable telemetry outbox")]
struct Cli {
    /// Config file (defaults to ~/.beacon/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging regardless of config.
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record one event in the outbox.
    Track {
        name: String,

        /// Property as key=value. Values parse as JSON, else as a string.
        #[arg(long = "prop", value_name = "KEY=VALUE")]
        props: Vec<String>,

        /// Properties as a JSON object, merged before --prop values.
        #[arg(long)]
        props_json: Option<String>,

        /// Upload right after enqueueing.
        #[arg(long)]
        flush: bool,
    },
    /// Upload pending events until the outbox is empty or an attempt fails.
    Flush,
    /// Print queue depth and age, applied remote config and metrics.
    Status,
    /// Print the effective configuration with secrets redacted.
    Config,
    /// Print a fresh base64 encryption key.
    GenKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Command::GenKey) {
        println!("{}", FieldCipher::generate_key());
        return Ok(());
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config_from_path(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let mut telemetry = TelemetryConfig::from_debug(cli.debug || config.debug_mode);
    telemetry.json = cli.json_logs;
    let guard = init_telemetry(telemetry);
    tracing::debug!(path = %config_path.display(), server_url = %config.server_url, "config loaded");

    if matches!(cli.command, Command::Config) {
        println!("{config:#?}");
        return Ok(());
    }

    let beacon = Beacon::init(config, BeaconDeps::default().with_metrics(guard.metrics()))
        .context("failed to start beacon")?;

    let outcome = run(&beacon, cli.command).await;
    beacon.shutdown().await;
    outcome
}

async fn run(beacon: &Beacon, command: Command) -> Result<()> {
    match command {
        Command::Track {
            name,
            props,
            props_json,
            flush,
        } => {
            let properties = parse_properties(props_json.as_deref(), &props)?;
            let id = beacon
                .track_now(EventBuilder::new(name.as_str()).properties(properties))
                .await?;
            match id {
                Some(id) => println!("queued {name} as #{id}"),
                None => println!("{name} dropped by sampling or filters"),
            }
            if flush {
                drain(beacon).await?;
            }
        }
        Command::Flush => drain(beacon).await?,
        Command::Status => {
            let status = json!({
                "state": beacon.state().as_str(),
                "pending": beacon.pending_count()?,
                "oldestPendingAt": beacon.oldest_pending_at()?,
                "session": beacon.current_session(),
                "remoteConfig": beacon.remote_config(),
                "metrics": beacon.metrics().snapshot(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Config | Command::GenKey => {}
    }
    Ok(())
}

/// Upload batches until nothing is left. Stops at the first failure.
async fn drain(beacon: &Beacon) -> Result<()> {
    let mut total = 0;
    loop {
        match beacon.flush_now().await {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(BeaconError::Upload(UploadError::InFlight)) => {
                tokio::time::sleep(IN_FLIGHT_POLL).await;
            }
            Err(e) => {
                let pending = beacon.pending_count().unwrap_or_default();
                return Err(e).with_context(|| format!("flush stopped with {pending} events pending"));
            }
        }
    }
    println!("delivered {total} events");
    Ok(())
}

fn parse_properties(json_object: Option<&str>, pairs: &[String]) -> Result<Properties> {
    let mut properties = match json_object {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("--props-json is not JSON")? {
            Value::Object(map) => map,
            other => bail!("--props-json must be an object, got {other}"),
        },
        None => Properties::new(),
    };
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("property {pair:?} is not KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("property {pair:?} has an empty key");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
        properties.insert(key.to_owned(), value);
    }
    Ok(properties)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_parse_json_then_fall_back_to_string() {
        let props = parse_properties(None, &["count=3".into(), "plan=pro".into(), "ok=true".into()]).unwrap();
        assert_eq!(props["count"], 3);
        assert_eq!(props["plan"], "pro");
        assert_eq!(props["ok"], true);
    }

    #[test]
    fn pairs_override_json_object() {
        let props = parse_properties(Some(r#"{"plan":"free","seats":2}"#), &["plan=team".into()]).unwrap();
        assert_eq!(props["plan"], "team");
        assert_eq!(props["seats"], 2);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(parse_properties(None, &["novalue".into()]).is_err());
        assert!(parse_properties(None, &["=x".into()]).is_err());
        assert!(parse_properties(Some("[1,2]"), &[]).is_err());
        assert!(parse_properties(Some("{not json"), &[]).is_err());
    }

    #[test]
    fn cli_parses_track() {
        let cli = Cli::parse_from(["beacon", "--debug", "track", "signup", "--prop", "plan=pro", "--flush"]);
        assert!(cli.debug);
        match cli.command {
            Command::Track { name, props, flush, .. } => {
                assert_eq!(name, "signup");
                assert_eq!(props, vec!["plan=pro"]);
                assert!(flush);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
