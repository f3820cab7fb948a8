use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::domain::Vehicle;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub controller: ControllerConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Vehicles registered at start-up.
    #[serde(default)]
    pub vehicles: Vec<Vehicle>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Bearer token for mutating endpoints. Empty disables the check.
    #[serde(default)]
    pub api_token: String,
}

fn default_request_timeout() -> u64 {
    30
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    pub tick_seconds: u64,
    pub command_delay_ms: u64,
    pub concurrent: bool,
    pub max_charge_start_failures: u32,
    pub failure_backoff_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandsConfig {
    /// Empty selects the simulated vehicle API.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_command_timeout")]
    pub timeout_seconds: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            password: String::new(),
            access_token: None,
            retries: default_retries(),
            timeout_seconds: default_command_timeout(),
        }
    }
}

fn default_retries() -> u32 {
    3
}

fn default_command_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub telegram_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// JSON snapshot of the durable controller state. Unset keeps everything in memory.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file("config/default.toml"))
                .merge(Env::prefixed("CHARGEBOT__").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        figment.extract().context("invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GridStrategy;

    const TOML: &str = r#"
        [server]
        host = "127.0.0.1"
        port = 8080

        [controller]
        tick_seconds = 60
        command_delay_ms = 2000
        concurrent = true
        max_charge_start_failures = 10
        failure_backoff_minutes = 5

        [[vehicles]]
        vin = "5YJ3E7EB0KF000001"
        display_name = "Model 3"
        enabled = true
        target_soc = 80
        max_amps = 16
        num_phases = 3
        surplus_charging = true
        min_surplus = 2000
        min_charge_time = 15
        lowcost_charging = true
        max_price = 25
        grid_provider = "tibber"
        grid_strategy = "departure_with_price_limit"
        depart_days = "12345"
        depart_time = "07:00"
    "#;

    #[test]
    fn test_load_from_toml() {
        let cfg = Config::from_figment(Figment::new().merge(Toml::string(TOML))).unwrap();
        assert_eq!(cfg.server.socket_addr().unwrap().port(), 8080);
        assert!(cfg.commands.endpoint.is_empty());
        assert_eq!(cfg.commands.retries, 3);
        assert_eq!(cfg.commands.timeout_seconds, 30);
        assert!(cfg.storage.snapshot_path.is_none());
        assert!(cfg.notifications.telegram_token.is_empty());
        assert_eq!(cfg.vehicles.len(), 1);
        assert_eq!(
            cfg.vehicles[0].grid_strategy,
            GridStrategy::DepartureWithPriceLimit
        );
    }

    #[test]
    fn test_partial_commands_section_keeps_defaults() {
        let toml = format!("{TOML}\n[commands]\nendpoint = \"http://proxy:8080/api\"\n");
        let cfg = Config::from_figment(Figment::new().merge(Toml::string(&toml))).unwrap();
        assert_eq!(cfg.commands.endpoint, "http://proxy:8080/api");
        assert_eq!(cfg.commands.retries, 3);
        assert_eq!(cfg.commands.timeout_seconds, 30);
    }

    #[test]
    fn test_missing_section_is_an_error() {
        let err = Config::from_figment(Figment::new().merge(Toml::string("[server]\nhost = \"x\"")));
        assert!(err.is_err());
    }
}
