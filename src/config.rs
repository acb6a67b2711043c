use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use tracing::{info, warn};

use crate::cache::bucket_count_for;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub version: Option<String>,
    /// 监听地址，每个地址同时开启 UDP 与 TCP。
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    /// 上游权威服务器。
    #[serde(default = "default_target")]
    pub target: String,
    /// 服务器私钥（64 位十六进制）。
    #[serde(default)]
    pub private_key: Option<String>,
    /// 转发查询时使用的源地址，需与上游同一地址族。
    #[serde(default)]
    pub source_ip: Option<String>,
    /// 上游（内部）超时，毫秒。
    #[serde(default = "default_internal_timeout_ms")]
    pub internal_timeout_ms: u64,
    /// UDP 最大发送次数。
    #[serde(default = "default_udp_tries")]
    pub udp_tries: u32,
    #[serde(default = "default_tcp_max_connections")]
    pub tcp_max_connections: u32,
    /// 客户端（外部）TCP 超时，毫秒。
    #[serde(default = "default_tcp_timeout_ms")]
    pub tcp_timeout_ms: u64,
    /// 共享密钥缓存容量。
    #[serde(default = "default_shared_secrets")]
    pub shared_secrets: usize,
    #[serde(default = "default_udp_buffer_size")]
    pub udp_buffer_size: usize,
    #[serde(default = "default_tcp_buffer_size")]
    pub tcp_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            version: None,
            listen: default_listen(),
            target: default_target(),
            private_key: None,
            source_ip: None,
            internal_timeout_ms: default_internal_timeout_ms(),
            udp_tries: default_udp_tries(),
            tcp_max_connections: default_tcp_max_connections(),
            tcp_timeout_ms: default_tcp_timeout_ms(),
            shared_secrets: default_shared_secrets(),
            udp_buffer_size: default_udp_buffer_size(),
            tcp_buffer_size: default_tcp_buffer_size(),
        }
    }
}

fn default_listen() -> Vec<String> {
    vec!["0.0.0.0:53".to_string()]
}

fn default_target() -> String {
    "127.0.0.1:5353".to_string()
}

fn default_internal_timeout_ms() -> u64 {
    1200
}

fn default_udp_tries() -> u32 {
    2
}

fn default_tcp_max_connections() -> u32 {
    25
}

fn default_tcp_timeout_ms() -> u64 {
    60_000
}

fn default_shared_secrets() -> usize {
    5000
}

fn default_udp_buffer_size() -> usize {
    4096
}

fn default_tcp_buffer_size() -> usize {
    8192
}

pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: RelayConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }
    Ok(cfg)
}

/// 运行期参数：解析、校验并钳制后的配置 / Validated, clamped settings shared by every transaction.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: Vec<SocketAddr>,
    pub target: SocketAddr,
    pub source_ip: Option<IpAddr>,
    pub internal_timeout: Duration,
    pub udp_tries: u8,
    pub tcp_max_connections: usize,
    pub tcp_timeout: Duration,
    pub shared_secrets: usize,
    pub cache_buckets: usize,
    pub udp_buffer_size: usize,
    pub tcp_buffer_size: usize,
}

fn clamp_logged<T: PartialOrd + Copy + std::fmt::Display>(name: &str, value: T, min: T, max: T) -> T {
    let clamped = if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    };
    if clamped != value {
        warn!(target = "config", field = name, value = %value, used = %clamped, "value out of range, clamped");
    }
    clamped
}

impl RuntimeConfig {
    pub fn from_config(cfg: &RelayConfig) -> Result<Self> {
        if cfg.listen.is_empty() {
            bail!("no listen address configured");
        }
        let listen = cfg
            .listen
            .iter()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid listen address: {addr}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let target: SocketAddr = cfg
            .target
            .parse()
            .with_context(|| format!("invalid target address: {}", cfg.target))?;

        let source_ip = match cfg.source_ip.as_deref() {
            None | Some("") => None,
            Some(raw) => {
                let ip: IpAddr = raw
                    .parse()
                    .with_context(|| format!("invalid source ip: {raw}"))?;
                if ip.is_ipv4() != target.is_ipv4() {
                    bail!("source ip {ip} is not in the same address family as target {target}");
                }
                Some(ip)
            }
        };

        let internal_timeout_ms = clamp_logged("internal_timeout_ms", cfg.internal_timeout_ms, 10, 60_000);
        let udp_tries = clamp_logged("udp_tries", cfg.udp_tries, 1, 50);
        let tcp_max_connections = clamp_logged("tcp_max_connections", cfg.tcp_max_connections, 1, 500);
        let tcp_timeout_ms = clamp_logged("tcp_timeout_ms", cfg.tcp_timeout_ms, 1000, 86_400_000);

        // 过小的缓存没有意义，保持默认值
        let shared_secrets = if cfg.shared_secrets > 50 {
            cfg.shared_secrets
        } else {
            warn!(
                target = "config",
                value = cfg.shared_secrets,
                "shared_secrets must exceed 50, keeping default"
            );
            default_shared_secrets()
        };

        if cfg.udp_buffer_size < 512 || cfg.tcp_buffer_size < 512 {
            bail!(
                "buffer sizes must be at least 512 bytes (udp {}, tcp {})",
                cfg.udp_buffer_size,
                cfg.tcp_buffer_size
            );
        }

        Ok(Self {
            listen,
            target,
            source_ip,
            internal_timeout: Duration::from_millis(internal_timeout_ms),
            udp_tries: udp_tries as u8,
            tcp_max_connections: tcp_max_connections as usize,
            tcp_timeout: Duration::from_millis(tcp_timeout_ms),
            shared_secrets,
            cache_buckets: bucket_count_for(shared_secrets),
            udp_buffer_size: cfg.udp_buffer_size,
            tcp_buffer_size: cfg.tcp_buffer_size,
        })
    }
}
