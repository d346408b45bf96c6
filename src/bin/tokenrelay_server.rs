//! TokenRelay gRPC Server
//!
//! A standalone server binary for running the relay over gRPC, backed by the
//! durable token store, a file audit log, and the built-in result feed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use tokenrelay::storage::spawn_sweeper;
use tokenrelay::transport::RelayServiceImpl;
use tokenrelay::{
    open_store, AbsentOffsetPolicy, AuditSink, FileAuditSink, InMemoryFeed, RelayConfig, ResultFeed,
    SessionEngine, TokenStore,
};

/// How often expired store entries are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Server configuration
struct Config {
    /// Address to bind to
    addr: SocketAddr,
    /// Data directory for the token store
    data_dir: PathBuf,
    /// Audit log path; defaults to `<data_dir>/audit.log`
    audit_log: Option<PathBuf>,
    /// Upper bound on waiting for an unpublished offset
    max_wait: Duration,
    /// Start from the feed tail instead of waiting for an offset
    start_from_tail: bool,
    /// Default log filter when `RUST_LOG` is unset
    log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 50061)),
            data_dir: PathBuf::from("./relay.data"),
            audit_log: None,
            max_wait: RelayConfig::default().rendezvous.offset_max_wait,
            start_from_tail: false,
            log_level: "info".to_string(),
        }
    }
}

fn value_for(args: &[String], i: usize) -> &str {
    if let Some(value) = args.get(i + 1) {
        value
    } else {
        eprintln!("error: {} requires a value", args[i]);
        std::process::exit(1);
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                let raw = value_for(&args, i);
                let port: u16 = raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid port number: {raw}");
                    std::process::exit(1);
                });
                config.addr.set_port(port);
                i += 2;
            }
            "--data-dir" | "-d" => {
                config.data_dir = PathBuf::from(value_for(&args, i));
                i += 2;
            }
            "--audit-log" => {
                config.audit_log = Some(PathBuf::from(value_for(&args, i)));
                i += 2;
            }
            "--max-wait-ms" => {
                let raw = value_for(&args, i);
                let ms: u64 = raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid --max-wait-ms: {raw}");
                    std::process::exit(1);
                });
                config.max_wait = Duration::from_millis(ms);
                i += 2;
            }
            "--start-from-tail" => {
                config.start_from_tail = true;
                i += 1;
            }
            "--log-level" => {
                config.log_level = value_for(&args, i).to_string();
                i += 2;
            }
            "--help" | "-h" => {
                println!("tokenrelay-server - TokenRelay gRPC Server");
                println!();
                println!("USAGE:");
                println!("    tokenrelay-server [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -p, --port <PORT>         Port to listen on [default: 50061]");
                println!("    -d, --data-dir <DIR>      Data directory [default: ./relay.data]");
                println!("        --audit-log <FILE>    Audit log [default: <data-dir>/audit.log]");
                println!("        --max-wait-ms <MS>    Max wait for an unpublished offset [default: 30000]");
                println!("        --start-from-tail     Start at the feed tail when no offset is published");
                println!("        --log-level <FILTER>  Log filter when RUST_LOG is unset [default: info]");
                println!("    -h, --help                Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = parse_args();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut relay = RelayConfig::default();
    relay.rendezvous.offset_max_wait = config.max_wait;
    if config.start_from_tail {
        relay.rendezvous.absent_offset = AbsentOffsetPolicy::StartFromTail;
    }
    let relay = relay.validate()?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), data_dir = %config.data_dir.display(), "starting tokenrelay");

    // Holds an exclusive lock on the data directory for the process lifetime.
    let store: Arc<dyn TokenStore> = Arc::new(open_store(&config.data_dir, relay.ttl.clone(), None)?);

    let audit_path = config
        .audit_log
        .clone()
        .unwrap_or_else(|| config.data_dir.join("audit.log"));
    let audit: Arc<dyn AuditSink> = Arc::new(FileAuditSink::open(&audit_path, &relay.audit)?);

    let feed = InMemoryFeed::new();
    let engine = SessionEngine::new(
        Arc::clone(&store),
        Arc::new(feed.clone()) as Arc<dyn ResultFeed>,
        audit,
        relay,
    )?;
    let sweeper = spawn_sweeper(store, SWEEP_INTERVAL);

    let svc = RelayServiceImpl::new(engine).with_ingest_feed(feed).into_server();

    tracing::info!(addr = %config.addr, audit_log = %audit_path.display(), "serving gRPC");

    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(config.addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    sweeper.abort();
    tracing::info!("shut down");
    Ok(())
}
