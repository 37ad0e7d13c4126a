//! Configuration document shapes (§6 Configuration options). Both
//! binaries load one of these from a JSON file named by `-config
//! <path>`; loading itself (argv parsing, file I/O) lives in each
//! binary's own `config.rs` so the error messages can be binary-
//! specific, but the shape is shared here.

use serde::{Deserialize, Serialize};

fn default_mtu() -> u16 {
    1400
}

fn default_keepalive_interval() -> u32 {
    30
}

fn default_keepalive_timeout() -> u32 {
    90
}

fn default_max_open_conns() -> u32 {
    10
}

fn default_max_idle_conns() -> u32 {
    5
}

fn default_conn_max_lifetime() -> u64 {
    1800
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type", default = "default_database_type")]
    pub db_type: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// For the `sqlite` type, this is a filesystem path; `:memory:`
    /// selects the in-process ephemeral database.
    pub database: String,
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,
    #[serde(default = "default_conn_max_lifetime")]
    pub conn_max_lifetime: u64,
}

fn default_database_type() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub overlay_cidr: String,
    pub gateway_ip: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u32,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout: u32,
}

fn default_session_timeout() -> u32 {
    90
}

fn default_max_failed_auth() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u32,
    #[serde(default = "default_max_failed_auth")]
    pub max_failed_auth: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_timeout: default_session_timeout(),
            max_failed_auth: default_max_failed_auth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub listen: String,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    pub database: DatabaseConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Client,
    Gateway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleActionConfig {
    Forward,
    Direct,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRuleConfig {
    pub action: RuleActionConfig,
    pub destination: String,
    #[serde(default)]
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

fn default_bandwidth() -> u32 {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub mode: AgentMode,
    pub server: String,
    #[serde(default)]
    pub user_key: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_bandwidth")]
    pub bandwidth: u32,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub rules: Vec<AgentRuleConfig>,
    #[serde(default)]
    pub log: LogConfig,
}
