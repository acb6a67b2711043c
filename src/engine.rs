use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::crypto::SecretKey;
use crate::dnscurve::DnsCurve;
use crate::error::RelayError;
use crate::tcp::TcpTransaction;
use crate::udp::UdpTransaction;

/// 随机源端口绑定尝试次数
const RANDOM_BIND_ATTEMPTS: usize = 10;
/// 上游源端口范围
const SOURCE_PORTS: RangeInclusive<u16> = 1025..=65535;

/// 进程级共享上下文 / Process-wide context handed to every transaction.
#[derive(Clone)]
pub struct Engine {
    config: Arc<RuntimeConfig>,
    curve: Arc<DnsCurve>,
    tcp_slots: Arc<Semaphore>,
}

impl Engine {
    pub fn new(config: RuntimeConfig, secret: SecretKey) -> Result<Self> {
        let curve = DnsCurve::new(secret, config.cache_buckets, config.shared_secrets)
            .context("initialise shared secret cache")?;
        let tcp_slots = Arc::new(Semaphore::new(config.tcp_max_connections));
        Ok(Self {
            config: Arc::new(config),
            curve: Arc::new(curve),
            tcp_slots,
        })
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn curve(&self) -> &DnsCurve {
        &self.curve
    }

    fn upstream_domain(&self) -> Domain {
        if self.config.target.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        }
    }

    /// Binds to the configured source address (if any) on a random port
    /// above 1024. After ten failed attempts the kernel picks the port.
    fn bind_random(&self, socket: &Socket) {
        let ip = self.config.source_ip.unwrap_or(if self.config.target.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        });
        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_BIND_ATTEMPTS {
            let port = rng.gen_range(SOURCE_PORTS);
            if socket.bind(&SocketAddr::new(ip, port).into()).is_ok() {
                return;
            }
        }
        warn!(
            target = "engine",
            source = %ip,
            "unable to bind to source address and random port, letting the kernel choose"
        );
        if self.config.source_ip.is_some() {
            let _ = socket.bind(&SocketAddr::new(ip, 0).into());
        }
    }

    /// Fresh upstream UDP socket for one forwarding attempt.
    pub fn open_upstream_udp(&self) -> io::Result<UdpSocket> {
        let socket = Socket::new(self.upstream_domain(), Type::DGRAM, Some(Protocol::UDP))?;
        self.bind_random(&socket);
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }

    pub async fn connect_upstream_tcp(&self) -> io::Result<TcpStream> {
        let socket = Socket::new(self.upstream_domain(), Type::STREAM, Some(Protocol::TCP))?;
        self.bind_random(&socket);
        socket.set_nonblocking(true)?;
        let socket = TcpSocket::from_std_stream(socket.into());
        socket.connect(self.config.target).await
    }

    /// UDP 接收循环：每个数据报一个事务
    pub async fn run_udp(self, socket: Arc<UdpSocket>) -> Result<()> {
        let mut buf = vec![0u8; self.config.udp_buffer_size];
        loop {
            let (len, client) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(err) => {
                    warn!(target = "udp", error = %err, "udp receive failed");
                    continue;
                }
            };
            debug!(target = "udp", client = %client, len, "query received");

            let engine = self.clone();
            let listener = Arc::clone(&socket);
            let datagram = buf[..len].to_vec();
            tokio::spawn(async move {
                let result = match UdpTransaction::accept(engine, listener, client, datagram) {
                    Ok(transaction) => transaction.run().await,
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    log_transaction_error("udp", client, &err);
                }
            });
        }
    }

    /// TCP 接收循环，受并发连接数上限约束
    ///
    /// A permit is taken before `accept`, so once every slot is busy the
    /// listener is simply not polled until a connection finishes.
    pub async fn run_tcp(self, listener: TcpListener) -> Result<()> {
        loop {
            let permit = match Arc::clone(&self.tcp_slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    info!(
                        target = "tcp",
                        max = self.config.tcp_max_connections,
                        "reached maximum number of TCP connections, waiting"
                    );
                    Arc::clone(&self.tcp_slots)
                        .acquire_owned()
                        .await
                        .context("tcp admission closed")?
                }
                Err(TryAcquireError::Closed) => anyhow::bail!("tcp admission closed"),
            };

            let (stream, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(err) => {
                    warn!(target = "tcp", error = %err, "unable to accept TCP connection");
                    continue;
                }
            };
            debug!(target = "tcp", client = %peer, "connection accepted");

            let engine = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = TcpTransaction::new(engine, stream, peer).run().await {
                    log_transaction_error("tcp", peer, &err);
                }
            });
        }
    }

    pub fn flush_cache(&self) {
        let stats = self.curve.flush_cache();
        debug!(target = "engine", used = stats.used, "shared secret cache cleared");
    }

    /// SIGHUP flushes the cache; SIGINT/SIGTERM return.
    #[cfg(unix)]
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut hangup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
        let mut interrupt = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
        let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!(target = "engine", "received SIGHUP");
                    self.flush_cache();
                }
                _ = interrupt.recv() => {
                    info!(target = "engine", "received SIGINT, shutting down");
                    return Ok(());
                }
                _ = terminate.recv() => {
                    info!(target = "engine", "received SIGTERM, shutting down");
                    return Ok(());
                }
            }
        }
    }

    #[cfg(not(unix))]
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
        info!(target = "engine", "received ctrl-c, shutting down");
        Ok(())
    }
}

fn log_transaction_error(proto: &'static str, client: SocketAddr, err: &RelayError) {
    match err {
        RelayError::UpstreamTimeout { .. } | RelayError::Timeout(_) | RelayError::Closed(_) => {
            info!(target = proto, client = %client, error = %err, "transaction dropped");
        }
        _ => warn!(target = proto, client = %client, error = %err, "transaction failed"),
    }
}
