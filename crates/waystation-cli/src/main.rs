//! waystation - drive the offline cache from the command line.
//!
//! Each invocation restores the generation persisted in the cache
//! directory (installing it first if needed) and runs one command
//! against it.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use waystation_core::{
    CacheStorage, Config, ControlReply, DiskStorage, FetchOptions, Host, HttpOrigin,
    MaintenanceScheduler, Origin, Request, Settings,
};

const USAGE: &str = "\
Usage: waystation [--config PATH] [--log-dir DIR] <command>

Commands:
  install          Preload the configured manifest and activate it
  get <path>...    Fetch paths through the cache
  maintain         Prune the dynamic partition
  version          Print the active version
  partitions       List cache partitions
  message <json>   Post a raw control message
  serve            Run periodic maintenance until interrupted";

/// File name prefix for the rolling log
const LOG_FILE_PREFIX: &str = "waystation.log";

#[derive(Debug)]
enum Command {
    Install,
    Get(Vec<String>),
    Maintain,
    Version,
    Partitions,
    Message(String),
    Serve,
}

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    command: Command,
}

impl Args {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut config = None;
        let mut log_dir = None;
        let mut rest = Vec::new();

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    config = Some(PathBuf::from(args.next().context("--config needs a path")?))
                }
                "--log-dir" => {
                    log_dir = Some(PathBuf::from(
                        args.next().context("--log-dir needs a directory")?,
                    ))
                }
                "-h" | "--help" => bail!("{}", USAGE),
                _ => rest.push(arg),
            }
        }

        let mut rest = rest.into_iter();
        let command = match rest.next().as_deref() {
            Some("install") => Command::Install,
            Some("get") => {
                let paths: Vec<String> = rest.collect();
                if paths.is_empty() {
                    bail!("get needs at least one path\n\n{}", USAGE);
                }
                Command::Get(paths)
            }
            Some("maintain") => Command::Maintain,
            Some("version") => Command::Version,
            Some("partitions") => Command::Partitions,
            Some("serve") => Command::Serve,
            Some("message") => Command::Message(
                rest.next()
                    .with_context(|| format!("message needs a JSON argument\n\n{}", USAGE))?,
            ),
            Some(other) => bail!("Unknown command: {}\n\n{}", other, USAGE),
            None => bail!("{}", USAGE),
        };

        Ok(Self {
            config,
            log_dir,
            command,
        })
    }
}

/// Initialize the tracing subscriber. `RUST_LOG` controls the level.
/// With a log directory, output is also written to a daily rolling file;
/// the returned guard flushes it on drop.
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args = Args::parse(std::env::args().skip(1))?;
    let _log_guard = init_tracing(args.log_dir.as_ref());

    let mut config = match args.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply_env();
    let settings = config.settings()?;
    let cache_dir = config.cache_dir()?;
    debug!(cache_dir = %cache_dir.display(), "Using cache directory");

    let storage: Arc<dyn CacheStorage> = Arc::new(DiskStorage::new(cache_dir)?);
    let origin: Arc<dyn Origin> = Arc::new(HttpOrigin::with_timeout(settings.request_timeout)?);
    let host = Arc::new(Host::new(settings.clone(), storage, origin));

    if !matches!(args.command, Command::Install) && host.restore().await?.is_none() {
        info!(version = %settings.version, "No cached generation, installing");
        install(&host, &settings).await?;
    }

    match args.command {
        Command::Install => install(&host, &settings).await,
        Command::Get(paths) => get(&host, &settings, &paths).await,
        Command::Maintain => maintain(&host).await,
        Command::Version => version(&host).await,
        Command::Partitions => partitions(&host).await,
        Command::Message(raw) => message(&host, &raw).await,
        Command::Serve => serve(host, settings.maintenance_interval).await,
    }
}

async fn install(host: &Host, settings: &Settings) -> Result<()> {
    let outcome = host
        .install(settings.version.clone(), &settings.manifest)
        .await?;
    println!(
        "Installed {} ({} entries in {})",
        outcome.version, outcome.preload.entries, outcome.preload.partition
    );
    if let Some(activation) = outcome.activation {
        for name in &activation.deleted {
            println!("  removed {}", name);
        }
        for name in &activation.failed {
            eprintln!("  could not remove {}", name);
        }
    }
    Ok(())
}

async fn get(host: &Host, settings: &Settings, paths: &[String]) -> Result<()> {
    for path in paths {
        let url = settings
            .scope
            .join(path)
            .with_context(|| format!("Invalid path: {}", path))?;
        match host
            .fetch(None, Request::get(url.clone()), FetchOptions::default())
            .await
        {
            Ok(response) => {
                let source = if response.from_cache { "cache" } else { "network" };
                println!(
                    "{} {} ({}, {} bytes)",
                    response.status.as_u16(),
                    url,
                    source,
                    response.body.len()
                );
            }
            Err(e) => eprintln!("{}: {}", url, e),
        }
    }
    Ok(())
}

async fn maintain(host: &Host) -> Result<()> {
    let report = host
        .run_maintenance()
        .await
        .context("No active generation")?;
    if report.skipped {
        println!("Maintenance already running");
        return Ok(());
    }
    println!(
        "Expired {}, trimmed {}, {} failed deletes",
        report.expired, report.trimmed, report.failed_deletes
    );
    for error in &report.errors {
        eprintln!("  {}", error);
    }
    Ok(())
}

async fn version(host: &Host) -> Result<()> {
    let (client, mut replies) = host.connect().await;
    host.post_message(client, r#"{"type":"GET_VERSION"}"#)
        .await?;
    match replies.recv().await {
        Some(ControlReply::Version { version }) => println!("{}", version),
        None => bail!("No reply to GET_VERSION"),
    }
    host.disconnect(client).await;
    Ok(())
}

async fn partitions(host: &Host) -> Result<()> {
    let storage = host.storage();
    for name in storage.list_partitions().await? {
        let keys = storage.keys(&name).await?;
        // Entries are kept in insertion order, so the last key is the newest
        let newest = match keys.last() {
            Some(key) => storage.get(&name, key).await?,
            None => None,
        };
        match newest {
            Some(entry) => println!(
                "{}: {} entries, newest {}",
                name,
                keys.len(),
                entry.age_display()
            ),
            None => println!("{}: empty", name),
        }
    }
    Ok(())
}

async fn message(host: &Host, raw: &str) -> Result<()> {
    let (client, mut replies) = host.connect().await;
    host.post_message(client, raw).await?;
    while let Ok(reply) = replies.try_recv() {
        println!("{}", serde_json::to_string(&reply)?);
    }
    host.disconnect(client).await;
    Ok(())
}

/// Keep the host alive with maintenance running every `period` until Ctrl-C.
async fn serve(host: Arc<Host>, period: Duration) -> Result<()> {
    let scheduler = MaintenanceScheduler::spawn(Arc::clone(&host), period);
    info!(period_secs = period.as_secs(), "Maintenance scheduler started");
    println!(
        "Serving {}, maintenance every {}s (Ctrl-C to stop)",
        host.settings().scope,
        period.as_secs()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    scheduler.stop();
    info!("Maintenance scheduler stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        Args::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_get_with_options() {
        let args = parse(&["--config", "/tmp/c.json", "get", "/a", "/b"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/tmp/c.json")));
        assert!(args.log_dir.is_none());
        match args.command {
            Command::Get(paths) => assert_eq!(paths, vec!["/a", "/b"]),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_missing_arguments() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["get"]).is_err());
        assert!(parse(&["message"]).is_err());
        assert!(parse(&["--log-dir"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
    }

    #[test]
    fn test_parse_serve() {
        let args = parse(&["serve"]).unwrap();
        assert!(matches!(args.command, Command::Serve));
    }

    #[test]
    fn test_parse_message() {
        let args = parse(&["message", r#"{"type":"GET_VERSION"}"#, "--log-dir", "logs"]).unwrap();
        assert_eq!(args.log_dir, Some(PathBuf::from("logs")));
        assert!(matches!(args.command, Command::Message(ref raw) if raw.contains("GET_VERSION")));
    }
}
