//! Configuration tree (SPEC_FULL.md §2.4), grounded on the teacher's
//! `config/mod.rs`: `serde` + `serde_yaml` deserialization, `validator`
//! derive validation, a single `Config::load_from_yaml` entry point, and
//! inline `#[cfg(test)]` coverage at the same density the teacher uses.
//!
//! Fixed-shape parts of the tree (the listener port, remote connection
//! parameters) get concrete typed fields, the same as `Route`/`Upstream`
//! do in the teacher. Free-form per-plugin blocks use [`ConfigValue`],
//! a `serde_yaml::Value` playing the same role the teacher gives
//! `serde_json::Value`.

use std::collections::HashMap;
use std::fs;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{BouncerError, BouncerResult};

/// Free-form configuration payload, handed to a plugin's own builder to
/// deserialize into whatever shape it expects.
pub type ConfigValue = serde_yaml::Value;

fn default_proxy_port() -> u16 {
    6677
}

fn default_max_lines() -> usize {
    200
}

fn default_keepalive_interval() -> u64 {
    60
}

fn default_keepalive_timeout() -> u64 {
    20
}

fn default_reconnect_timeout() -> u64 {
    30
}

/// Root of the configuration tree, read from a single YAML file.
#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    /// `irc/proxy/port` — the port every bouncer's client-facing
    /// listener binds, unless a bouncer overrides it.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    #[validate(nested)]
    #[serde(default)]
    pub bouncers: HashMap<String, BouncerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct KeepaliveConfig {
    #[serde(default = "default_keepalive_interval")]
    pub interval: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub timeout: u64,
    #[serde(default = "default_reconnect_timeout")]
    pub reconnect_timeout: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            interval: default_keepalive_interval(),
            timeout: default_keepalive_timeout(),
            reconnect_timeout: default_reconnect_timeout(),
        }
    }
}

/// A single `irc/bouncers/<name>` entry: one upstream identity, the
/// password clients must present to attach to it, and the plugins
/// enabled on it. Every bouncer shares the one process-global
/// client-facing listener on `irc/proxy/port`; clients are routed to
/// their bouncer by the name in `PASS <name>:<password>`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BouncerConfig {
    #[validate(nested)]
    pub remote: RemoteEntry,

    /// Password clients must present to attach to this bouncer.
    pub password: Option<String>,

    #[serde(default)]
    pub plugins: HashMap<String, ConfigValue>,

    #[serde(default)]
    pub messagebuffer: MessageBufferConfig,

    /// `irc/perform/<name>` — raw lines sent upstream once registered.
    #[serde(default)]
    pub perform: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RemoteEntry {
    #[validate(length(min = 1, message = "remote.server must not be empty"))]
    pub server: String,
    pub port: u16,
    #[validate(length(min = 1, message = "remote.user must not be empty"))]
    pub user: String,
    #[validate(length(min = 1, message = "remote.real must not be empty"))]
    pub real: String,
    #[validate(length(min = 1, message = "remote.nick must not be empty"))]
    pub nick: String,
    #[serde(default)]
    pub throttle: bool,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBufferConfig {
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    #[serde(default)]
    pub specific: HashMap<String, usize>,
}

impl Default for MessageBufferConfig {
    fn default() -> Self {
        MessageBufferConfig {
            max_lines: default_max_lines(),
            specific: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load_from_yaml<P>(path: P) -> BouncerResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .map_err(|e| BouncerError::Configuration(format!("unable to read conf file from {path}: {e}")))?;
        log::debug!("conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> BouncerResult<Self> {
        let conf: Config = serde_yaml::from_str(conf_str)?;
        conf.validate()
            .map_err(|e| BouncerError::Configuration(format!("conf file validation failed: {e}")))?;
        Ok(conf)
    }

}

impl BouncerConfig {
    pub fn remote_config(&self) -> crate::irc::RemoteConfig {
        crate::irc::RemoteConfig {
            server: self.remote.server.clone(),
            port: self.remote.port,
            password: self.remote.password.clone(),
            user: self.remote.user.clone(),
            real: self.remote.real.clone(),
            nick: self.remote.nick.clone(),
            throttle: self.remote.throttle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
proxy_port: 6677
keepalive:
  interval: 60
  timeout: 20
  reconnect_timeout: 30
bouncers:
  work:
    remote:
      server: irc.example.org
      port: 6697
      user: bouncer
      real: Bouncer User
      nick: bouncer
      throttle: true
    password: secret
    perform:
      - "JOIN #home"
    plugins:
      keepalive: {}
      autoinvite: {}
    messagebuffer:
      max_lines: 100
      specific:
        "#busy": 500
"#;

    #[test]
    fn parses_full_sample() {
        let conf = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(conf.proxy_port, 6677);
        let bouncer = conf.bouncers.get("work").unwrap();
        assert_eq!(bouncer.remote.server, "irc.example.org");
        assert_eq!(bouncer.messagebuffer.specific.get("#busy"), Some(&500));
        assert!(bouncer.plugins.contains_key("keepalive"));
    }

    #[test]
    fn missing_remote_fields_fail_validation() {
        let bad = r#"
bouncers:
  broken:
    remote:
      server: ""
      port: 6667
      user: u
      real: r
      nick: n
"#;
        assert!(Config::from_yaml(bad).is_err());
    }

    #[test]
    fn defaults_apply_when_omitted() {
        let minimal = r#"
bouncers:
  solo:
    remote:
      server: irc.example.org
      port: 6667
      user: u
      real: r
      nick: n
"#;
        let conf = Config::from_yaml(minimal).unwrap();
        assert_eq!(conf.proxy_port, 6677);
        let bouncer = conf.bouncers.get("solo").unwrap();
        assert_eq!(bouncer.messagebuffer.max_lines, 200);
        assert!(!bouncer.remote.throttle);
    }
}
