//! # Node Configuration
//!
//! One configuration type for every node of the hierarchy; the role picks
//! the defaults.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FUELNET_NODE_ID=3   FUELNET_UPSTREAM_ADDR=10.0.0.5:6000            │
//! │     DISTRIBUIDOR_HOST / DISTRIBUIDOR_PORT   (pump)                     │
//! │     EMPRESA_HOST / EMPRESA_PORT             (distributor)              │
//! │     ESTANQUE_HOST                           (pump, distributor)        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fuelnet/<role>.toml (Linux)                              │
//! │     ~/Library/Application Support/net.fuelnet.fuelnet/<role>.toml      │
//! │                                                                         │
//! │  3. Role Defaults (lowest priority)                                    │
//! │     tank :5000 · distributor :6000 · company :7000                     │
//! │     pump → distributor every 60 s · distributor → company every 30 s   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # pump.toml
//! [node]
//! id = "2"
//! data_dir = "/var/lib/fuelnet"
//!
//! [upstream]
//! addr = "distribuidor:6000"
//!
//! [upstream.backoff]
//! strategy = "fixed"      # fixed | exponential
//! interval_secs = 60
//!
//! [tank]
//! addr = "estanque:5000"
//!
//! [sale]
//! dispense_secs = 20
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fuelnet_core::validation::validate_unit_id;
use fuelnet_core::{Commodity, DEFAULT_TANK_LEVEL, DEFAULT_UNIT_SLOTS};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::{BackoffPolicy, BackoffStrategy, ExponentialBackoff, FixedBackoff};
use crate::error::{SyncError, SyncResult};
use crate::hub::HubConfig;
use crate::supervisor::SupervisorConfig;

// =============================================================================
// Role
// =============================================================================

/// Which node of the hierarchy a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Tank,
    Pump,
    Distributor,
    Company,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Tank => "tank",
            Role::Pump => "pump",
            Role::Distributor => "distributor",
            Role::Company => "company",
        }
    }

    /// Port this role listens on, if it accepts connections.
    pub fn default_listen_port(&self) -> Option<u16> {
        match self {
            Role::Tank => Some(5000),
            Role::Distributor => Some(6000),
            Role::Company => Some(7000),
            Role::Pump => None,
        }
    }

    /// Parent address, if this role has a parent.
    pub fn default_upstream_addr(&self) -> Option<&'static str> {
        match self {
            Role::Pump => Some("localhost:6000"),
            Role::Distributor => Some("localhost:7000"),
            Role::Tank | Role::Company => None,
        }
    }

    /// Fixed reconnect interval towards the parent.
    pub fn default_backoff(&self) -> Duration {
        match self {
            Role::Pump => Duration::from_secs(60),
            _ => Duration::from_secs(30),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Node Section
// =============================================================================

/// Identity and storage location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSection {
    /// Pump id. Resolved from local state when absent.
    #[serde(default)]
    pub id: Option<String>,

    /// Distributor or company name, sent as its id upward.
    #[serde(default)]
    pub name: Option<String>,

    /// Directory for every persisted file of this node.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

// =============================================================================
// Listen Section
// =============================================================================

/// Inbound listener (tank, distributor, company).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Role default when absent.
    #[serde(default)]
    pub port: Option<u16>,

    /// Time a new child has to answer IDENTIFY.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_handshake_timeout() -> u64 {
    10
}

impl Default for ListenSection {
    fn default() -> Self {
        ListenSection {
            bind_addr: default_bind_addr(),
            port: None,
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

// =============================================================================
// Upstream Section
// =============================================================================

/// Reconnect policy towards the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSection {
    #[serde(default)]
    pub strategy: BackoffStrategy,

    /// Fixed interval, or the first delay when exponential. Role default
    /// when absent.
    #[serde(default)]
    pub interval_secs: Option<u64>,

    /// Cap for the exponential strategy.
    #[serde(default = "default_max_backoff")]
    pub max_secs: u64,
}

fn default_max_backoff() -> u64 {
    300
}

impl Default for BackoffSection {
    fn default() -> Self {
        BackoffSection {
            strategy: BackoffStrategy::Fixed,
            interval_secs: None,
            max_secs: default_max_backoff(),
        }
    }
}

/// Connection to the parent node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSection {
    /// `host:port`. Role default when absent.
    #[serde(default)]
    pub addr: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default)]
    pub backoff: BackoffSection,
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for UpstreamSection {
    fn default() -> Self {
        UpstreamSection {
            addr: None,
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            backoff: BackoffSection::default(),
        }
    }
}

// =============================================================================
// Tank Section
// =============================================================================

/// Tank location for clients, and ledger settings for the tank itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TankSection {
    #[serde(default = "default_tank_addr")]
    pub addr: String,

    /// Level of every commodity on a fresh tank.
    #[serde(default = "default_initial_level")]
    pub initial_level: u32,

    #[serde(default = "default_autosave")]
    pub autosave_secs: u64,
}

fn default_tank_addr() -> String {
    "localhost:5000".to_string()
}

fn default_initial_level() -> u32 {
    DEFAULT_TANK_LEVEL
}

fn default_autosave() -> u64 {
    30
}

impl Default for TankSection {
    fn default() -> Self {
        TankSection {
            addr: default_tank_addr(),
            initial_level: default_initial_level(),
            autosave_secs: default_autosave(),
        }
    }
}

// =============================================================================
// Sale Section
// =============================================================================

/// Pump behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleSection {
    /// Seconds a dispensing cycle keeps the pump busy.
    #[serde(default = "default_dispense")]
    pub dispense_secs: u64,

    /// Slots tried when a pump has to pick its own id.
    #[serde(default = "default_unit_slots")]
    pub max_unit_slots: u32,

    /// Commodities sold. Every grade when empty.
    #[serde(default)]
    pub carried: Vec<Commodity>,
}

fn default_dispense() -> u64 {
    20
}

fn default_unit_slots() -> u32 {
    DEFAULT_UNIT_SLOTS
}

impl Default for SaleSection {
    fn default() -> Self {
        SaleSection {
            dispense_secs: default_dispense(),
            max_unit_slots: default_unit_slots(),
            carried: Vec::new(),
        }
    }
}

// =============================================================================
// Report Section
// =============================================================================

/// Distributor digests sent to the company.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSection {
    #[serde(default = "default_report_interval")]
    pub interval_secs: u64,
}

fn default_report_interval() -> u64 {
    300
}

impl Default for ReportSection {
    fn default() -> Self {
        ReportSection {
            interval_secs: default_report_interval(),
        }
    }
}

// =============================================================================
// Node Config
// =============================================================================

/// Complete configuration of one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,

    #[serde(default)]
    pub listen: ListenSection,

    #[serde(default)]
    pub upstream: UpstreamSection,

    #[serde(default)]
    pub tank: TankSection,

    #[serde(default)]
    pub sale: SaleSection,

    #[serde(default)]
    pub report: ReportSection,
}

impl NodeConfig {
    /// Loads configuration for `role` from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (`<role>.toml`)
    /// 3. Environment variables
    pub fn load(role: Role, config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(|| Self::default_config_path(role)) {
            if path.exists() {
                info!(?path, %role, "Loading node config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides(role);
        config.validate(role)?;
        Ok(config)
    }

    /// Validates the configuration for `role`.
    pub fn validate(&self, role: Role) -> SyncResult<()> {
        if let Some(id) = &self.node.id {
            validate_unit_id(id)
                .map_err(|e| SyncError::InvalidConfig(format!("node.id: {}", e)))?;
        }
        if let Some(name) = &self.node.name {
            validate_unit_id(name)
                .map_err(|e| SyncError::InvalidConfig(format!("node.name: {}", e)))?;
        }

        if let Some(addr) = self.upstream_addr(role) {
            if !addr.contains(':') {
                return Err(SyncError::InvalidConfig(format!(
                    "upstream.addr must be host:port, got: {}",
                    addr
                )));
            }
        }
        if !self.tank.addr.contains(':') {
            return Err(SyncError::InvalidConfig(format!(
                "tank.addr must be host:port, got: {}",
                self.tank.addr
            )));
        }

        if self.upstream.backoff.interval_secs == Some(0) {
            return Err(SyncError::InvalidConfig(
                "upstream.backoff.interval_secs must be greater than 0".into(),
            ));
        }
        if self.sale.max_unit_slots == 0 {
            return Err(SyncError::InvalidConfig(
                "sale.max_unit_slots must be greater than 0".into(),
            ));
        }
        if self.report.interval_secs == 0 || self.tank.autosave_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "report.interval_secs and tank.autosave_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self, role: Role) {
        self.apply_overrides(role, |key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, role: Role, var: impl Fn(&str) -> Option<String>) {
        if let Some(id) = var("FUELNET_NODE_ID") {
            debug!(node_id = %id, "Overriding node id from environment");
            self.node.id = Some(id);
        }
        if let Some(name) = var("FUELNET_NODE_NAME") {
            self.node.name = Some(name);
        }
        if let Some(dir) = var("FUELNET_DATA_DIR") {
            self.node.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(port) = var("FUELNET_LISTEN_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.listen.port = Some(p),
                Err(_) => warn!(%port, "Ignoring invalid FUELNET_LISTEN_PORT"),
            }
        }

        // Host/port pairs used by container deployments.
        let parent = match role {
            Role::Pump => Some(("DISTRIBUIDOR_HOST", "DISTRIBUIDOR_PORT", 6000)),
            Role::Distributor => Some(("EMPRESA_HOST", "EMPRESA_PORT", 7000)),
            Role::Tank | Role::Company => None,
        };
        if let Some((host_key, port_key, default_port)) = parent {
            let host = var(host_key);
            let port = var(port_key);
            if host.is_some() || port.is_some() {
                let host = host.unwrap_or_else(|| "localhost".to_string());
                let port = port.unwrap_or_else(|| default_port.to_string());
                debug!(%host, %port, "Overriding upstream from environment");
                self.upstream.addr = Some(format!("{}:{}", host, port));
            }
        }
        if let Some(host) = var("ESTANQUE_HOST") {
            self.tank.addr = format!("{}:5000", host);
        }

        if let Some(addr) = var("FUELNET_UPSTREAM_ADDR") {
            debug!(%addr, "Overriding upstream from environment");
            self.upstream.addr = Some(addr);
        }
        if let Some(addr) = var("FUELNET_TANK_ADDR") {
            self.tank.addr = addr;
        }
    }

    /// Returns the default config file path for `role`.
    fn default_config_path(role: Role) -> Option<PathBuf> {
        directories::ProjectDirs::from("net", "fuelnet", "fuelnet")
            .map(|dirs| dirs.config_dir().join(format!("{}.toml", role)))
    }

    // =========================================================================
    // Resolved Settings
    // =========================================================================

    pub fn data_dir(&self) -> PathBuf {
        self.node.data_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("net", "fuelnet", "fuelnet")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from("data"))
        })
    }

    /// Configured name, or a generated one for a role that needs a name.
    pub fn node_name(&self, role: Role) -> String {
        self.node.name.clone().unwrap_or_else(|| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("{}-{}", role, &suffix[..8])
        })
    }

    pub fn listen_port(&self, role: Role) -> u16 {
        self.listen
            .port
            .or_else(|| role.default_listen_port())
            .unwrap_or(0)
    }

    pub fn upstream_addr(&self, role: Role) -> Option<String> {
        self.upstream
            .addr
            .clone()
            .or_else(|| role.default_upstream_addr().map(str::to_string))
    }

    pub fn hub_config(&self, role: Role) -> HubConfig {
        HubConfig {
            bind_addr: self.listen.bind_addr.clone(),
            port: self.listen_port(role),
            handshake_timeout: Duration::from_secs(self.listen.handshake_timeout_secs),
        }
    }

    pub fn supervisor_config(&self, role: Role) -> Option<SupervisorConfig> {
        self.upstream_addr(role).map(|addr| SupervisorConfig {
            parent_addr: addr,
            connect_timeout: Duration::from_secs(self.upstream.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.upstream.handshake_timeout_secs),
        })
    }

    pub fn backoff_policy(&self, role: Role) -> Arc<dyn BackoffPolicy> {
        let interval = self
            .upstream
            .backoff
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| role.default_backoff());
        match self.upstream.backoff.strategy {
            BackoffStrategy::Fixed => Arc::new(FixedBackoff::new(interval)),
            BackoffStrategy::Exponential => Arc::new(ExponentialBackoff::new(
                interval,
                Duration::from_secs(self.upstream.backoff.max_secs),
            )),
        }
    }

    /// Commodities a pump sells.
    pub fn carried(&self) -> Vec<Commodity> {
        if self.sale.carried.is_empty() {
            Commodity::ALL.to_vec()
        } else {
            self.sale.carried.clone()
        }
    }
}
