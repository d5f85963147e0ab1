//! Deployment configuration: schema, defaults, and load-time invariants.
//!
//! The deployment description is a YAML document with a strict schema.
//! Everything the rest of the manager does is a pure function of the
//! [`DeploymentConfig`] loaded here, so all validation happens up front
//! and the loaded value is immutable afterwards.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file does not exist.
    #[error("config file not found: {0}")]
    NotFound(String),

    /// The config file exists but could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid YAML or does not match the schema.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The document parsed but a field violates its own constraints.
    #[error("config schema violation at `{path}`: {reason}")]
    Schema { path: String, reason: String },

    /// A cross-entity invariant does not hold.
    #[error("config invariant violated: {0}")]
    Invariant(String),
}

impl ConfigError {
    fn schema(path: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Schema {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Root of the deployment description. Immutable after [`load`](Self::load).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentConfig {
    /// Path prefix every routed module lives under.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    pub gateway: GatewayConfig,

    /// Server name -> server definition. A BTreeMap so every iteration is
    /// already in ascending name order, which the gateway renderer relies on.
    pub servers: BTreeMap<String, ServerConfig>,

    pub websocket: WebsocketConfig,

    /// Module name -> server name, for WebSocket routing.
    #[serde(default)]
    pub websocket_routes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub port: u16,
    #[serde(default = "default_worker_processes")]
    pub worker_processes: WorkerProcesses,
    #[serde(default = "default_worker_connections")]
    pub worker_connections: u32,
}

/// Gateway worker count: a fixed number, or one worker per core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerProcesses {
    Auto,
    Fixed(u32),
}

impl<'de> Deserialize<'de> for WorkerProcesses {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u32),
            Sentinel(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Count(0) => Err(serde::de::Error::custom("worker_processes must be positive")),
            Raw::Count(n) => Ok(WorkerProcesses::Fixed(n)),
            Raw::Sentinel(s) if s == "auto" => Ok(WorkerProcesses::Auto),
            Raw::Sentinel(s) => Err(serde::de::Error::custom(format!(
                "unrecognized worker_processes value {s:?} (expected a count or \"auto\")"
            ))),
        }
    }
}

impl fmt::Display for WorkerProcesses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerProcesses::Auto => f.write_str("auto"),
            WorkerProcesses::Fixed(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Port of instance 0; instance k binds `port + k`.
    pub port: u16,
    pub instances: u16,
    /// Modules hosted by this server, in declared order.
    pub modules: Vec<String>,
    /// Opaque hint passed through to the launched server.
    #[serde(default)]
    pub reload: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebsocketConfig {
    pub routing_strategy: RoutingStrategy,
    #[serde(default)]
    pub query_param_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Path,
    QueryParam,
}

/// One launchable server process, derived from a [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct InstanceDescriptor {
    /// `{server_name}-{k}`.
    pub name: String,
    pub port: u16,
    pub modules: Vec<String>,
    pub reload: bool,
}

impl InstanceDescriptor {
    /// The module whose health endpoint stands in for the whole instance.
    pub fn health_module(&self) -> &str {
        // `modules` is validated non-empty at load.
        &self.modules[0]
    }
}

fn default_api_base_url() -> String {
    "/api/v1".to_string()
}

fn default_worker_processes() -> WorkerProcesses {
    WorkerProcesses::Fixed(1)
}

fn default_worker_connections() -> u32 {
    1024
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl DeploymentConfig {
    /// Loads and validates a deployment config from a YAML file.
    ///
    /// No side effects: the filesystem is only read.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.display().to_string())
            } else {
                ConfigError::Io(e)
            }
        })?;
        let config: DeploymentConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.is_empty() || !self.api_base_url.starts_with('/') {
            return Err(ConfigError::schema(
                "api_base_url",
                "must be a non-empty path beginning with `/`",
            ));
        }
        if self.gateway.port == 0 {
            return Err(ConfigError::schema("gateway.port", "port 0 is not bindable"));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::schema(
                "servers",
                "at least one server is required",
            ));
        }

        for (name, server) in &self.servers {
            let at = |field: &str| format!("servers.{name}.{field}");
            if !is_identifier(name) {
                return Err(ConfigError::schema(
                    format!("servers.{name}"),
                    "server names may contain only letters, digits, `-` and `_`",
                ));
            }
            if server.port == 0 {
                return Err(ConfigError::schema(at("port"), "port 0 is not bindable"));
            }
            if server.instances == 0 {
                return Err(ConfigError::schema(
                    at("instances"),
                    "at least one instance is required",
                ));
            }
            if u32::from(server.port) + u32::from(server.instances) - 1 > u32::from(u16::MAX) {
                return Err(ConfigError::schema(
                    at("port"),
                    "derived instance ports exceed 65535",
                ));
            }
            if server.modules.is_empty() {
                return Err(ConfigError::schema(
                    at("modules"),
                    "at least one module is required",
                ));
            }
            let mut seen = HashSet::new();
            for module in &server.modules {
                if !is_identifier(module) {
                    return Err(ConfigError::schema(
                        at("modules"),
                        format!("invalid module name {module:?}"),
                    ));
                }
                if !seen.insert(module.as_str()) {
                    return Err(ConfigError::schema(
                        at("modules"),
                        format!("module {module:?} listed twice"),
                    ));
                }
            }
        }

        if self.websocket.routing_strategy == RoutingStrategy::QueryParam
            && self
                .websocket
                .query_param_name
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(ConfigError::schema(
                "websocket.query_param_name",
                "required when routing_strategy is query_param",
            ));
        }

        // Port uniqueness across the gateway and every derived instance port.
        let mut ports = HashSet::new();
        ports.insert(self.gateway.port);
        for (name, server) in &self.servers {
            for k in 0..server.instances {
                let port = server.port + k;
                if !ports.insert(port) {
                    return Err(ConfigError::Invariant(format!(
                        "port {port} (server {name}) is assigned more than once"
                    )));
                }
            }
        }

        // A module may be hosted by at most one server.
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for (name, server) in &self.servers {
            for module in &server.modules {
                if let Some(other) = owners.insert(module, name) {
                    return Err(ConfigError::Invariant(format!(
                        "module {module:?} is declared by both {other} and {name}"
                    )));
                }
            }
        }

        for (module, server) in &self.websocket_routes {
            if !self.servers.contains_key(server) {
                return Err(ConfigError::Invariant(format!(
                    "websocket route {module:?} references unknown server {server:?}"
                )));
            }
        }

        Ok(())
    }

    /// `api_base_url` without a trailing slash, for path joining.
    pub fn api_prefix(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }

    /// Derives the launchable instance list, in ascending server-name order.
    pub fn instances(&self) -> Vec<InstanceDescriptor> {
        self.servers
            .iter()
            .flat_map(|(name, server)| {
                (0..server.instances).map(move |k| InstanceDescriptor {
                    name: format!("{name}-{k}"),
                    port: server.port + k,
                    modules: server.modules.clone(),
                    reload: server.reload,
                })
            })
            .collect()
    }

    /// The gateway port plus every derived instance port, ascending.
    pub fn port_set(&self) -> Vec<u16> {
        let mut ports: BTreeSet<u16> = BTreeSet::new();
        ports.insert(self.gateway.port);
        for server in self.servers.values() {
            for k in 0..server.instances {
                ports.insert(server.port + k);
            }
        }
        ports.into_iter().collect()
    }

    /// The module probed through the gateway to confirm end-to-end routing:
    /// the first module of the first server in ascending name order.
    pub fn gateway_health_module(&self) -> &str {
        // `servers` and each `modules` list are validated non-empty.
        &self.servers.values().next().unwrap().modules[0]
    }
}
