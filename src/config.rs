//! On-disk system configuration.
//!
//! A plain `serde::Deserialize` wire struct, loaded fresh on every read, with a fixed wire
//! shape rather than a version-negotiated one -- there is no schema evolution to support.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// One backend array: endpoint, operator-supplied service credentials, and whether to skip
/// TLS verification when talking to it. Immutable after construction; a changed entry on
/// reload is handled by rebuilding the whole `BackendSystem`, not by mutating this in place.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SystemEntry {
    pub endpoint: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub insecure: bool,
}

/// `{ "{family}": { "{system-id}": SystemEntry } }`, decoded straight from the JSON document at
/// `--config`.
pub type SystemConfig = HashMap<String, HashMap<String, SystemEntry>>;

/// Read and parse the system configuration file at `path`.
pub fn load_system_config(path: &Path) -> Result<SystemConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    let parsed: SystemConfig = serde_json::from_str(&raw)?;
    Ok(parsed)
}

/// Pull just the systems for one backend family out of a freshly loaded config, defaulting to
/// empty if the family is absent (an operator may run with only a subset of families
/// configured).
pub fn systems_for_family<'a>(
    config: &'a SystemConfig,
    family: &str,
) -> std::borrow::Cow<'a, HashMap<String, SystemEntry>> {
    match config.get(family) {
        Some(systems) => std::borrow::Cow::Borrowed(systems),
        None => std::borrow::Cow::Owned(HashMap::new()),
    }
}

/// The process-wide CLI surface.
#[derive(Debug, structopt::StructOpt)]
#[structopt(
    name = "authz-proxy",
    about = "A multi-tenant authorization sidecar for storage-provisioning traffic."
)]
pub struct Opt {
    /// The path of the system configuration file.
    #[structopt(
        short = "c",
        long = "config",
        default_value = "/etc/authz-proxy/config.json"
    )]
    pub config: PathBuf,

    /// Base URL of the policy engine, e.g. http://localhost:8181.
    #[structopt(long = "policy-host", default_value = "http://localhost:8181")]
    pub policy_host: String,

    /// Connection URL of the ledger store, e.g. redis://localhost:6379.
    #[structopt(long = "redis-url", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Address to bind the proxy's HTTP listener on.
    #[structopt(long = "bind", default_value = "0.0.0.0:8080")]
    pub bind: std::net::SocketAddr,

    /// Show debug log information.
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_family_system_shape() {
        let raw = r#"
        {
            "powerflex": {
                "542a2d5f5122210f": {
                    "endpoint": "https://flex.example.com",
                    "user": "admin",
                    "password": "secret",
                    "insecure": true
                }
            },
            "powermax": {}
        }
        "#;
        let parsed: SystemConfig = serde_json::from_str(raw).unwrap();
        let flex = &parsed["powerflex"]["542a2d5f5122210f"];
        assert_eq!(flex.endpoint, "https://flex.example.com");
        assert!(flex.insecure);
        assert!(parsed["powermax"].is_empty());
    }

    #[test]
    fn insecure_defaults_false() {
        let raw = r#"{"powermax":{"sys0":{"endpoint":"https://e","user":"u","password":"p"}}}"#;
        let parsed: SystemConfig = serde_json::from_str(raw).unwrap();
        assert!(!parsed["powermax"]["sys0"].insecure);
    }

    #[test]
    fn systems_for_family_defaults_empty() {
        let parsed: SystemConfig = serde_json::from_str("{}").unwrap();
        let empty = systems_for_family(&parsed, "powerscale");
        assert!(empty.is_empty());
    }
}
