//! Process configuration loading (§6 Process/Configuration). A single
//! required `-config <path>` flag names a JSON document deserialized
//! into [`CoordinatorConfig`]; anything wrong with it is fatal at
//! startup, never silently defaulted, since there is no sensible
//! default `listen` address or database for a coordinator (cf. the
//! agent-side argv style in the pack's `beam-agent` CLI).

use anyhow::{bail, Context, Result};
use tunnel_protocol::config::CoordinatorConfig;

pub fn parse_config_path() -> Result<std::path::PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-config" | "--config" => {
                i += 1;
                let path = args.get(i).context("missing value for -config")?;
                return Ok(std::path::PathBuf::from(path));
            }
            "-h" | "--help" => {
                println!("tunnel-coordinator -config <path>");
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    bail!("-config <path> is required")
}

pub fn load_config(path: &std::path::Path) -> Result<CoordinatorConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: CoordinatorConfig =
        serde_json::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults_applied() {
        let json = r#"{
            "listen": "0.0.0.0:4443",
            "database": { "type": "sqlite", "database": ":memory:" },
            "network": { "overlay_cidr": "10.200.0.0/16", "gateway_ip": "10.200.0.1" }
        }"#;
        let config: CoordinatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.network.mtu, 1400);
        assert_eq!(config.security.session_timeout, 90);
        assert_eq!(config.log.level, "info");
    }
}
