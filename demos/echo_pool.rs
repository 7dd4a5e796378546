//! Pooled Echo Client
//!
//! Starts a local echo server (unless `--target` is given) and hammers it
//! with many concurrent clients sharing one connection pool, then prints how
//! often connections were reused.
//!
//! Usage:
//!   cargo run --release --example echo_pool -- --clients 200 --max 8
//!   cargo run --example echo_pool -- --config pool.toml --log-level debug

use anyhow::{bail, Context, Result};
use clap::Parser;
use netpool::{Pool, PoolConfig, PoolError, ReturnPolicy};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "echo_pool")]
#[command(about = "Concurrent echo clients sharing a connection pool", long_about = None)]
struct Args {
    /// Pool configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Generate example configuration file and exit
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Existing echo server to use instead of the built-in one
    #[arg(short, long)]
    target: Option<String>,

    /// Concurrent clients
    #[arg(long, default_value = "100")]
    clients: usize,

    /// Round trips per client
    #[arg(long, default_value = "10")]
    rounds: usize,

    /// Max pool capacity (overrides config)
    #[arg(long)]
    max: Option<usize>,

    /// Reuse connections oldest first instead of newest first
    #[arg(long)]
    queue_order: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = args.generate_config {
        PoolConfig::create_example(&path)?;
        println!("Example pool configuration written to {:?}", path);
        return Ok(());
    }

    init_logging(&args.log_level)?;

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading pool configuration from: {:?}", path);
            PoolConfig::from_file(path)?
        }
        None => PoolConfig {
            max_capacity: 8,
            ..Default::default()
        },
    };
    if let Some(max) = args.max {
        config.max_capacity = max;
    }
    if args.queue_order {
        config.return_policy = ReturnPolicy::QueueOrder;
    }

    let target = match args.target {
        Some(target) => target,
        None => spawn_echo_server().await?.to_string(),
    };

    let pool = Pool::connect(target.clone(), config)
        .await
        .with_context(|| format!("creating pool for {}", target))?;
    info!(%target, config = ?pool.current_config(), "Pool ready");

    let start = Instant::now();
    let mut tasks = Vec::with_capacity(args.clients);
    for client in 0..args.clients {
        let pool = pool.clone();
        let rounds = args.rounds;
        tasks.push(tokio::spawn(async move {
            run_client(&pool, client, rounds).await
        }));
    }

    let mut failures = 0usize;
    let mut connections = std::collections::HashSet::new();
    for task in tasks {
        match task.await? {
            Ok(ids) => connections.extend(ids),
            Err(e) => {
                warn!("Client failed: {}", e);
                failures += 1;
            }
        }
    }

    let elapsed = start.elapsed();
    let status = pool.status();
    println!(
        "{} clients x {} rounds in {:?}: {} failed, {} distinct connections, {} live, {} idle",
        args.clients,
        args.rounds,
        elapsed,
        failures,
        connections.len(),
        status.live,
        status.idle
    );

    pool.close().await;

    if failures > 0 {
        bail!("{} clients failed", failures);
    }
    Ok(())
}

/// Runs `rounds` round trips, borrowing a connection for each one.
async fn run_client(
    pool: &Pool<TcpStream>,
    client: usize,
    rounds: usize,
) -> std::result::Result<Vec<u64>, PoolError> {
    let mut used = Vec::with_capacity(rounds);
    for round in 0..rounds {
        let mut conn = pool.acquire().await?;
        used.push(conn.id());

        let message = format!("client {} round {}\n", client, round);
        conn.write_all(message.as_bytes()).await?;

        let mut reply = vec![0u8; message.len()];
        AsyncReadExt::read_exact(&mut conn, &mut reply).await?;
        if reply != message.as_bytes() {
            conn.mark_unusable();
            warn!(client, round, "Echo mismatch, discarding connection");
        }

        debug!(client, round, id = conn.id(), "Round trip complete");
        conn.close()?;
    }
    Ok(used)
}

async fn spawn_echo_server() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("binding echo server")?;
    let addr = listener.local_addr()?;
    info!("Echo server listening on {}", addr);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_echo(stream, peer));
                }
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    });

    Ok(addr)
}

async fn handle_echo(mut stream: TcpStream, peer: SocketAddr) {
    let mut buf = vec![0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    debug!("Error writing to {}", peer);
                    break;
                }
            }
            Err(e) => {
                debug!("Error reading from {}: {}", peer, e);
                break;
            }
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {}", level))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
