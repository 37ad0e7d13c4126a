//! Process configuration loading (§6 Process/Configuration). Mirrors
//! the coordinator's `-config <path>` convention; additionally accepts
//! `-id <agent_id>` on the command line as a convenience override since
//! an agent, unlike the coordinator, commonly has no fixed identity
//! until first run (cf. `frecar-beam/crates/agent/src/cli.rs`, which
//! layers a handful of optional flags over a required config path the
//! same way).

use anyhow::{bail, Context, Result};
use tunnel_protocol::config::{AgentConfig, AgentMode};

pub struct Args {
    pub config_path: std::path::PathBuf,
    pub id_override: Option<String>,
}

pub fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut id_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-config" | "--config" => {
                i += 1;
                config_path = Some(std::path::PathBuf::from(
                    args.get(i).context("missing value for -config")?,
                ));
            }
            "-id" | "--id" => {
                i += 1;
                id_override = Some(args.get(i).context("missing value for -id")?.clone());
            }
            "-h" | "--help" => {
                println!("tunnel-agent -config <path> [-id <agent_id>]");
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        config_path: config_path.context("-config <path> is required")?,
        id_override,
    })
}

pub fn load_config(path: &std::path::Path) -> Result<AgentConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: AgentConfig =
        serde_json::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

/// §6 Configuration options: `user_key` is required for client mode,
/// `id` for gateway mode (the `-id` flag counts as supplying it). A
/// missing required field is a `ConfigError`, fatal at startup.
pub fn validate(config: &AgentConfig, id_override: Option<&str>) -> Result<()> {
    match config.mode {
        AgentMode::Client if config.user_key.is_none() => {
            bail!("config error: user_key is required for mode=client");
        }
        AgentMode::Gateway if config.id.is_none() && id_override.is_none() => {
            bail!("config error: id is required for mode=gateway (set \"id\" in the config file or pass -id)");
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults_applied() {
        let json = r#"{
            "mode": "client",
            "server": "127.0.0.1:4443"
        }"#;
        let config: AgentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.bandwidth, 0);
        assert!(!config.insecure_skip_verify);
        assert!(config.rules.is_empty());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn client_without_user_key_is_rejected() {
        let json = r#"{"mode": "client", "server": "127.0.0.1:4443"}"#;
        let config: AgentConfig = serde_json::from_str(json).unwrap();
        assert!(validate(&config, None).is_err());
    }

    #[test]
    fn gateway_without_id_or_override_is_rejected() {
        let json = r#"{"mode": "gateway", "server": "127.0.0.1:4443"}"#;
        let config: AgentConfig = serde_json::from_str(json).unwrap();
        assert!(validate(&config, None).is_err());
        assert!(validate(&config, Some("gw-1")).is_ok());
    }
}
