//! wgnc - netcat over a WireGuard tunnel
//!
//! Reads a WireGuard configuration file, brings up a userspace tunnel to
//! its first usable peer and relays stdin/stdout over one TCP connection
//! made through the tunnel.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use wgnc::bootstrap::{self, BootstrapOptions, DEFAULT_MTU};
use wgnc::config::{parse_port, ConnectionPlan, DEFAULT_CONNECT_PORT};
use wgnc::relay;
use wgnc::resolver::{FixedDnsResolver, DEFAULT_DNS_SERVER};
use wgnc::WgncError;

/// wgnc - connect stdin/stdout to a TCP port behind a WireGuard peer
#[derive(Parser, Debug)]
#[command(name = "wgnc")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to WireGuard configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Port to connect to when PORT is not given
    #[arg(short, long, default_value_t = DEFAULT_CONNECT_PORT)]
    port: u16,

    /// Tunnel MTU
    #[arg(long, default_value_t = DEFAULT_MTU)]
    mtu: usize,

    /// DNS server used to resolve the peer endpoint (IP or IP:PORT)
    #[arg(long, value_parser = parse_dns_server, default_value_t = DEFAULT_DNS_SERVER)]
    dns: SocketAddr,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the connection plan as JSON and exit
    #[arg(long)]
    print_plan: bool,

    /// Address to connect to inside the tunnel (default: the peer's /32 AllowedIPs)
    host: Option<String>,

    /// Port to connect to inside the tunnel
    #[arg(value_name = "PORT")]
    connect_port: Option<String>,
}

fn parse_dns_server(value: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| format!("invalid DNS server: {}", value))
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging; stdout carries relay data
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match block_on_detached(run(args)) {
        Ok(result) => result,
        Err(e) => Err(WgncError::from(e)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code())
        }
    }
}

/// Drive `future` on a multi-threaded runtime, then leave without waiting
/// for tasks still running.
///
/// The detached stdin copy sits in a blocking read; an ordinary runtime
/// drop would wait for it until stdin yields data or EOF.
fn block_on_detached<F: Future>(future: F) -> std::io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    Ok(output)
}

async fn run(args: Args) -> Result<(), WgncError> {
    tracing::debug!("Loading configuration from: {}", args.config.display());
    let mut plan = ConnectionPlan::from_file(&args.config)?;
    apply_overrides(&mut plan, &args)?;

    if args.print_plan {
        println!("{}", render_plan(&plan)?);
        return Ok(());
    }

    let target = plan.dial_target()?;

    let resolver = FixedDnsResolver::new(args.dns);
    let options = BootstrapOptions { mtu: args.mtu };
    let (_device, stack) = bootstrap::bring_up(&plan, &options, &resolver).await?;

    let received = relay::run(&stack, target, tokio::io::stdin(), tokio::io::stdout()).await?;
    tracing::debug!("Relay finished, {} bytes received", received);
    Ok(())
}

/// Apply the positional HOST and PORT and the `-p` flag to `plan`.
///
/// A positional port beats `-p`, which beats the port derived from
/// AllowedIPs.
fn apply_overrides(plan: &mut ConnectionPlan, args: &Args) -> Result<(), WgncError> {
    if let Some(host) = &args.host {
        plan.override_connect_address(host)?;
    }
    match &args.connect_port {
        Some(port) => plan.override_connect_port(parse_port(port)),
        None => plan.override_connect_port(args.port),
    }
    Ok(())
}

fn render_plan(plan: &ConnectionPlan) -> Result<String, WgncError> {
    let json = serde_json::to_string_pretty(plan).map_err(std::io::Error::from)?;
    Ok(json)
}
