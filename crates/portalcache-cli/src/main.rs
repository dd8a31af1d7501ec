//! portalcache - drive the offline service worker from a terminal.
//!
//! Each invocation starts a fresh worker over the on-disk stores, delivers
//! one event and waits for its background work before exiting.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portalcache_core::clock::SystemClock;
use portalcache_core::host::HeadlessHost;
use portalcache_core::network::{HttpNetwork, Network};
use portalcache_core::store::{CacheStorage, DiskCacheStorage};
use portalcache_core::{EventOutcome, FetchOutcome, Method, Request, Response, ServiceWorker, WorkerConfig, WorkerEvent};

// ============================================================================
// Constants
// ============================================================================

const USAGE: &str = "\
Usage: portalcache <command>

Commands:
  install                         Precache offline pages and assets
  activate                        Delete old stores, sweep, claim pages
  fetch <url> [-X METHOD] [-H 'Name: value']...
                                  Fetch a URL through the worker
  sweep                           Run the expiry sweeper
  push [json]                     Deliver a push message
  message <json>                  Post a page message to the worker
  stores                          List stores and their entry counts

Set RUST_LOG (e.g. RUST_LOG=debug) for more output.";

/// Log file name prefix inside the log directory
const LOG_FILE: &str = "portalcache.log";

#[derive(Debug, PartialEq)]
enum Command {
    Install,
    Activate,
    Fetch {
        url: String,
        method: Method,
        headers: Vec<(String, String)>,
    },
    Sweep,
    Push(Option<String>),
    Message(String),
    Stores,
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(command) = args.first() else {
        return Ok(Command::Help);
    };
    let rest = &args[1..];

    match command.as_str() {
        "install" => Ok(Command::Install),
        "activate" => Ok(Command::Activate),
        "sweep" => Ok(Command::Sweep),
        "stores" => Ok(Command::Stores),
        "push" => Ok(Command::Push(rest.first().cloned())),
        "message" => match rest.first() {
            Some(json) => Ok(Command::Message(json.clone())),
            None => bail!("message needs a JSON argument"),
        },
        "fetch" => parse_fetch(rest),
        "help" | "-h" | "--help" => Ok(Command::Help),
        other => bail!("Unknown command: {}", other),
    }
}

fn parse_fetch(args: &[String]) -> Result<Command> {
    let mut url = None;
    let mut method = Method::Get;
    let mut headers = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-H" => {
                let header = iter.next().context("-H needs a value")?;
                let (name, value) = header
                    .split_once(':')
                    .with_context(|| format!("Invalid header: {}", header))?;
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
            "-X" => {
                let value = iter.next().context("-X needs a value")?;
                method = Method::parse(value)?;
            }
            _ if url.is_none() => url = Some(arg.clone()),
            _ => bail!("Unexpected argument: {}", arg),
        }
    }

    Ok(Command::Fetch {
        url: url.context("fetch needs a URL")?,
        method,
        headers,
    })
}

/// Initialize the tracing subscriber: stderr, plus a daily log file when
/// `log_dir` is usable. The returned guard must live until exit.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        _ => (None, None),
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

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(Command::Help) => {
            println!("{}", USAGE);
            return Ok(());
        }
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    let config = WorkerConfig::load()?;
    let cache_dir = config.cache_dir().unwrap_or_else(|_| PathBuf::from("./cache"));
    let _guard = init_tracing(Some(&cache_dir.join("logs")));
    info!(?command, "portalcache starting");

    let network = Arc::new(HttpNetwork::new(config.origin_url()?, config.network_timeout())?);
    let storage = Arc::new(DiskCacheStorage::new(cache_dir.join("stores"))?);
    let host = Arc::new(HeadlessHost::default());
    let worker = ServiceWorker::new(
        config,
        storage.clone(),
        network.clone(),
        host.clone(),
        Arc::new(SystemClock),
    )?;

    let result = run(command, &worker, network.as_ref(), storage.as_ref(), host.as_ref()).await;
    worker.settle().await;
    result
}

async fn run(
    command: Command,
    worker: &ServiceWorker,
    network: &dyn Network,
    storage: &dyn CacheStorage,
    host: &HeadlessHost,
) -> Result<()> {
    match command {
        Command::Install => {
            expect_success(worker.dispatch(WorkerEvent::Install).await)?;
            println!("Installed ({})", worker.config().static_cache_name());
        }
        Command::Activate => {
            if let EventOutcome::Activated { deleted_stores } =
                expect_success(worker.dispatch(WorkerEvent::Activate).await)?
            {
                for name in deleted_stores {
                    println!("Deleted store {}", name);
                }
            }
            println!("Activated");
        }
        Command::Fetch { url, method, headers } => {
            let mut request = Request::new(method, url.parse().with_context(|| format!("Invalid URL: {}", url))?);
            for (name, value) in &headers {
                request = request.with_header(name, value.as_str());
            }
            let response = match worker.fetch(request.clone()).await {
                FetchOutcome::Respond(response) => response,
                FetchOutcome::Passthrough => {
                    eprintln!("(not intercepted, fetched directly)");
                    network.fetch(&request).await?
                }
            };
            print_response(&response)?;
        }
        Command::Sweep => {
            let outcome = worker.sweep().await?;
            println!("{:?}", outcome);
        }
        Command::Push(json) => {
            let outcome = worker
                .dispatch(WorkerEvent::Push {
                    data: json.map(String::into_bytes),
                })
                .await;
            expect_success(outcome)?;
            for notification in host.notifications().await {
                println!("{}", serde_json::to_string_pretty(&notification)?);
            }
        }
        Command::Message(json) => {
            expect_success(worker.dispatch(WorkerEvent::Message(json.into_bytes())).await)?;
            for (tag, interval) in host.periodic_syncs().await {
                println!("Registered periodic sync '{}' every {}s", tag, interval.as_secs());
            }
        }
        Command::Stores => {
            for name in storage.keys().await? {
                let count = storage.open(&name).await?.keys().await?.len();
                println!("{}\t{} entries", name, count);
            }
        }
        Command::Help => println!("{}", USAGE),
    }
    Ok(())
}

fn expect_success(outcome: EventOutcome) -> Result<EventOutcome> {
    match outcome {
        EventOutcome::Failed(message) => bail!(message),
        outcome => Ok(outcome),
    }
}

fn print_response(response: &Response) -> Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{} {}", response.status, response.status_text)?;
    for (name, value) in response.headers.iter() {
        writeln!(stdout, "{}: {}", name, value)?;
    }
    writeln!(stdout)?;
    stdout.write_all(&response.body)?;
    stdout.flush()?;
    Ok(())
}
