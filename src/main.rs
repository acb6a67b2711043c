mod base32;
mod cache;
mod config;
mod crypto;
mod dnscurve;
mod engine;
mod error;
mod proto_utils;
mod tcp;
mod udp;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{RelayConfig, RuntimeConfig, load_config};
use crate::crypto::SecretKey;
use crate::engine::Engine;

const DEFAULT_CONFIG: &str = "config/curvedns.json";

#[derive(Parser, Debug)]
#[command(author, version, about = "DNSCurve forwarding relay for authoritative name servers", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// 服务器私钥（十六进制），优先于配置文件
    #[arg(long = "private-key", env = "CURVEDNS_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a fresh server keypair.
    Keygen {
        /// Zone to print the name server name for.
        #[arg(long = "name")]
        name: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(Command::Keygen { name }) = &args.command {
        keygen(name.as_deref());
        return Ok(());
    }

    init_tracing(args.debug);

    let cfg = if args.config.exists() || args.config != PathBuf::from(DEFAULT_CONFIG) {
        load_config(&args.config).context("load config")?
    } else {
        warn!(path = %args.config.display(), "config file not found, using defaults");
        RelayConfig::default()
    };

    let key_hex = match args.private_key.as_deref().or(cfg.private_key.as_deref()) {
        Some(key) => key.to_string(),
        None => bail!("no private key configured (use --private-key, CURVEDNS_PRIVATE_KEY or private_key)"),
    };
    let secret = SecretKey::from_hex(&key_hex).context("parse private key")?;

    let runtime = RuntimeConfig::from_config(&cfg).context("validate config")?;
    let listen = runtime.listen.clone();
    let target = runtime.target;
    let engine = Engine::new(runtime, secret).context("initialise relay")?;

    for addr in listen {
        let udp = create_udp_socket(addr).with_context(|| format!("bind udp {addr}"))?;
        let udp = Arc::new(UdpSocket::from_std(udp).context("register udp socket")?);
        let tcp = create_tcp_listener(addr).with_context(|| format!("bind tcp {addr}"))?;
        let tcp = TcpListener::from_std(tcp).context("register tcp listener")?;

        let udp_engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = udp_engine.run_udp(udp).await {
                error!(listen = %addr, error = %err, "udp listener exited");
            }
        });
        let tcp_engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = tcp_engine.run_tcp(tcp).await {
                error!(listen = %addr, error = %err, "tcp listener exited");
            }
        });
        info!(listen = %addr, "listening on udp and tcp");
    }

    info!(
        target_addr = %target,
        public_key = %format!("uz5{}", base32::encode_key(&engine.curve().public_key())),
        "curvedns started"
    );

    engine.wait_for_shutdown().await
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(true);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn socket_domain(addr: SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

fn create_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    let socket = Socket::new(socket_domain(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    if let Err(e) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp send buffer size: {}", e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn create_tcp_listener(addr: SocketAddr) -> anyhow::Result<std::net::TcpListener> {
    let socket = Socket::new(socket_domain(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// 生成密钥对 / Prints a new keypair in the forms an operator needs.
fn keygen(zone: Option<&str>) {
    let secret = SecretKey::generate();
    let public = secret.public_key();
    let dns_public = format!("uz5{}", base32::encode_key(&public));

    println!("DNS public key:\t{dns_public}");
    println!("Hex public key:\t{}", hex::encode(public));
    println!("Hex secret key:\t{}", secret.to_hex());
    if let Some(zone) = zone {
        let zone = zone.trim_end_matches('.');
        println!();
        println!("Authoritative name server name:\n{dns_public}.{zone}");
    }
}
