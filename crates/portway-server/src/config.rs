//! Configuration: TOML (or JSON) file + CLI overrides.

use crate::outbound::{DestinationPolicy, DomainStrategy, FreedomConfig};
use crate::socks::{AuthType, ServerConfig};
use crate::sockopt::TproxyMode;
use portway_core::policy::{BufferPolicy, PolicyManager, SessionPolicy, Timeouts};
use portway_core::session::SniffingRequest;
use portway_core::{ProxyError, ProxyResult};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub inbounds: Vec<InboundSection>,
    #[serde(default)]
    pub outbound: OutboundSection,
}

/// `[log]`
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Record access events.
    #[serde(default = "default_true")]
    pub access: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            access: true,
        }
    }
}

/// `[policy]`: per-level overrides keyed by level number, e.g.
/// `[policy.levels.0]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicySection {
    #[serde(default)]
    pub levels: BTreeMap<String, LevelSection>,
}

/// One policy level. Times are in seconds; unset values keep the default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LevelSection {
    pub handshake: Option<u64>,
    pub conn_idle: Option<u64>,
    pub uplink_only: Option<u64>,
    pub downlink_only: Option<u64>,
    pub buffer_size: Option<usize>,
}

/// `[[inbounds]]`
#[derive(Debug, Clone, Deserialize)]
pub struct InboundSection {
    /// Unique name; used in access records and counter names.
    #[serde(default)]
    pub tag: String,
    /// Only `socks` is accepted.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Local IP to bind (default `127.0.0.1`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// TCP port to listen on. `0` picks a free port.
    pub port: Option<u16>,
    /// Unix domain socket path, instead of `port`.
    pub unix: Option<String>,
    /// Original-destination recovery for redirected connections.
    #[serde(default)]
    pub tproxy: TproxyMode,
    /// Register traffic counters for this inbound.
    #[serde(default)]
    pub stats: bool,
    #[serde(default)]
    pub sniffing: SniffingSection,
    /// Protocol settings.
    #[serde(default)]
    pub settings: SocksSettings,
}

/// `[inbounds.sniffing]`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SniffingSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub dest_override: Vec<String>,
    #[serde(default)]
    pub domains_excluded: Vec<String>,
    #[serde(default)]
    pub metadata_only: bool,
    #[serde(default)]
    pub route_only: bool,
}

/// `[inbounds.settings]` for the SOCKS protocol.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SocksSettings {
    #[serde(default)]
    pub auth: AuthSetting,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub udp: bool,
    /// Address advertised for UDP associations.
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub user_level: u32,
    /// Deprecated idle timeout in seconds.
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthSetting {
    #[default]
    Noauth,
    Password,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub user: String,
    pub pass: String,
}

/// `[outbound]` (direct).
#[derive(Debug, Clone, Deserialize)]
pub struct OutboundSection {
    #[serde(default = "default_allowed")]
    pub allowed_destinations: Vec<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub domain_strategy: DomainStrategy,
    /// Seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for OutboundSection {
    fn default() -> Self {
        Self {
            allowed_destinations: default_allowed(),
            max_connections: default_max_connections(),
            domain_strategy: DomainStrategy::default(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_protocol() -> String {
    "socks".to_string()
}
fn default_listen() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    1080
}
fn default_allowed() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_max_connections() -> usize {
    1024
}
fn default_connect_timeout() -> u64 {
    10
}

/// Where an inbound listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listen {
    Tcp { address: IpAddr, port: u16 },
    Unix(PathBuf),
}

/// A validated inbound.
#[derive(Debug, Clone)]
pub struct InboundConfig {
    pub tag: String,
    pub listen: Listen,
    pub tproxy: TproxyMode,
    pub stats: bool,
    pub sniffing: SniffingRequest,
    pub socks: ServerConfig,
}

/// Resolved configuration (paths expanded, CLI overrides applied,
/// everything validated).
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub access_log: bool,
    pub policy: PolicyManager,
    pub inbounds: Vec<InboundConfig>,
    pub outbound: FreedomConfig,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides<'a> {
    pub listen: Option<&'a str>,
    pub port: Option<u16>,
    pub log_level: Option<&'a str>,
    pub no_access_log: bool,
}

impl Config {
    /// Load the file at `config_path` (missing file means defaults), then
    /// apply `overrides`.
    ///
    /// `listen`/`port` overrides apply to the first TCP inbound; with no
    /// inbounds configured they create a SOCKS inbound.
    pub fn load(config_path: Option<&Path>, overrides: Overrides<'_>) -> ProxyResult<Self> {
        let mut file = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    parse_file(&expanded)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        if file.inbounds.is_empty() {
            file.inbounds.push(InboundSection {
                tag: "socks-in".to_string(),
                protocol: default_protocol(),
                listen: default_listen(),
                port: Some(default_port()),
                unix: None,
                tproxy: TproxyMode::Off,
                stats: false,
                sniffing: SniffingSection::default(),
                settings: SocksSettings::default(),
            });
        }
        if let Some(first) = file.inbounds.iter_mut().find(|i| i.unix.is_none()) {
            if let Some(listen) = overrides.listen {
                first.listen = listen.to_string();
            }
            if let Some(port) = overrides.port {
                first.port = Some(port);
            }
        }

        Self::from_file(file, overrides)
    }

    fn from_file(file: ConfigFile, overrides: Overrides<'_>) -> ProxyResult<Self> {
        let policy = build_policy(&file.policy)?;

        let mut inbounds = Vec::with_capacity(file.inbounds.len());
        let mut tags = std::collections::HashSet::new();
        for (i, section) in file.inbounds.into_iter().enumerate() {
            let inbound = build_inbound(i, section)?;
            if !tags.insert(inbound.tag.clone()) {
                return Err(ProxyError::Config(format!("duplicate inbound tag {}", inbound.tag)));
            }
            inbounds.push(inbound);
        }

        let outbound = FreedomConfig {
            policy: DestinationPolicy {
                allowed_destinations: file.outbound.allowed_destinations,
                max_connections: file.outbound.max_connections,
            },
            domain_strategy: file.outbound.domain_strategy,
            connect_timeout: Duration::from_secs(file.outbound.connect_timeout),
        };

        Ok(Self {
            log_level: overrides
                .log_level
                .map(str::to_string)
                .unwrap_or(file.log.level),
            access_log: file.log.access && !overrides.no_access_log,
            policy,
            inbounds,
            outbound,
        })
    }
}

fn parse_file(path: &Path) -> ProxyResult<ConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("config parse error: {e}")))
    } else {
        toml::from_str(&content).map_err(|e| ProxyError::Config(format!("config parse error: {e}")))
    }
}

fn build_policy(section: &PolicySection) -> ProxyResult<PolicyManager> {
    let mut manager = PolicyManager::default();
    for (key, level) in &section.levels {
        let number: u32 = key
            .parse()
            .map_err(|_| ProxyError::Config(format!("policy level {key:?} is not a number")))?;
        let defaults = SessionPolicy::default();
        let secs = |v: Option<u64>, d: Duration| v.map_or(d, Duration::from_secs);
        manager.set_level(
            number,
            SessionPolicy {
                timeouts: Timeouts {
                    handshake: secs(level.handshake, defaults.timeouts.handshake),
                    connection_idle: secs(level.conn_idle, defaults.timeouts.connection_idle),
                    uplink_only: secs(level.uplink_only, defaults.timeouts.uplink_only),
                    downlink_only: secs(level.downlink_only, defaults.timeouts.downlink_only),
                },
                buffer: BufferPolicy {
                    per_connection: level.buffer_size.unwrap_or(defaults.buffer.per_connection),
                },
            },
        );
    }
    Ok(manager)
}

fn build_inbound(index: usize, section: InboundSection) -> ProxyResult<InboundConfig> {
    let tag = if section.tag.is_empty() {
        format!("inbound-{index}")
    } else {
        section.tag
    };
    let bad = |msg: String| ProxyError::Config(format!("inbound {tag}: {msg}"));

    if section.protocol != "socks" {
        return Err(bad(format!("unknown protocol {:?}", section.protocol)));
    }

    let listen = match (section.port, section.unix) {
        (Some(port), None) => {
            let address = section
                .listen
                .parse()
                .map_err(|_| bad(format!("invalid listen address {:?}", section.listen)))?;
            Listen::Tcp { address, port }
        }
        (None, Some(path)) => {
            if section.tproxy != TproxyMode::Off {
                return Err(bad("tproxy needs a TCP listener".to_string()));
            }
            Listen::Unix(expand_tilde_str(&path))
        }
        _ => return Err(bad("exactly one of `port` and `unix` is required".to_string())),
    };

    let sniffing = SniffingRequest {
        enabled: section.sniffing.enabled,
        override_destination_for_protocol: section
            .sniffing
            .dest_override
            .iter()
            .map(|p| normalize_sniffer(p).map_err(&bad))
            .collect::<ProxyResult<_>>()?,
        exclude_for_domain: section
            .sniffing
            .domains_excluded
            .iter()
            .map(|d| d.to_ascii_lowercase())
            .collect(),
        metadata_only: section.sniffing.metadata_only,
        route_only: section.sniffing.route_only,
    };

    let settings = section.settings;
    let auth_type = match settings.auth {
        AuthSetting::Noauth => AuthType::NoAuth,
        AuthSetting::Password => AuthType::Password,
    };
    if auth_type == AuthType::Password && settings.accounts.is_empty() {
        return Err(bad("password auth needs at least one account".to_string()));
    }
    let accounts: HashMap<String, String> = settings
        .accounts
        .into_iter()
        .map(|a| (a.user, a.pass))
        .collect();

    Ok(InboundConfig {
        tag: tag.clone(),
        listen,
        tproxy: section.tproxy,
        stats: section.stats,
        sniffing,
        socks: ServerConfig {
            auth_type,
            accounts,
            address: settings.ip,
            udp_enabled: settings.udp,
            user_level: settings.user_level,
            timeout: settings.timeout.filter(|t| *t > 0).map(Duration::from_secs),
        },
    })
}

/// Canonical sniffer name, or an error for unknown protocols.
fn normalize_sniffer(name: &str) -> Result<String, String> {
    let canonical = match name.to_ascii_lowercase().as_str() {
        "http" => "http",
        "tls" | "https" | "ssl" => "tls",
        "quic" => "quic",
        "fakedns" => "fakedns",
        "fakedns+others" => "fakedns+others",
        _ => return Err(format!("unknown sniffing protocol {name:?}")),
    };
    Ok(canonical.to_string())
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
