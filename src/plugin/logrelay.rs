//! Relays the crate's own log records to attached clients, split into
//! four plugins by level (`log_debug`, `log_info`, `log_warning`,
//! `log_error`) so a proxy opts into only the levels it wants.
//!
//! Grounded on the teacher's... no, grounded directly on Kalisko's
//! `ircpp_log.c`: a single global `log` hook fans every record out to
//! whichever proxies have the matching level plugin enabled, from a
//! virtual `*log!kalisko@kalisko.proxy` bot addressed straight at the
//! bouncer's own nick.

use std::sync::Arc;

use serde::Deserialize;
use serde_yaml::Value as YamlValue;

use super::{IrcPlugin, PluginHost};
use crate::error::{BouncerError, BouncerResult};
use crate::irc::IrcMessage;
use crate::logging::EVENT_LOG;

pub const BOT_NICK: &str = "*log";
pub const PLUGIN_NAME_DEBUG: &str = "log_debug";
pub const PLUGIN_NAME_INFO: &str = "log_info";
pub const PLUGIN_NAME_WARNING: &str = "log_warning";
pub const PLUGIN_NAME_ERROR: &str = "log_error";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    fn matches(self, level_name: &str) -> bool {
        level_name == self.wire_name()
    }

    fn wire_name(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }

    /// `mIRC` colour-coded tag, matching the original's literal control
    /// bytes (`\x03<colour>` ... `\x0f`).
    fn tag(self) -> &'static str {
        match self {
            Level::Debug => "\x033debug\x0f",
            Level::Info => "\x0312info\x0f",
            Level::Warning => "\x037warning\x0f",
            Level::Error => "\x034error\x0f",
        }
    }

    fn plugin_name(self) -> &'static str {
        match self {
            Level::Debug => PLUGIN_NAME_DEBUG,
            Level::Info => PLUGIN_NAME_INFO,
            Level::Warning => PLUGIN_NAME_WARNING,
            Level::Error => PLUGIN_NAME_ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Config {}

fn build(cfg: YamlValue, level: Level) -> BouncerResult<Arc<dyn IrcPlugin>> {
    let _: Config = serde_yaml::from_value(cfg)
        .map_err(|e| BouncerError::Plugin(format!("invalid {} config: {e}", level.plugin_name())))?;
    Ok(Arc::new(LogRelay { level }))
}

pub fn create_debug(cfg: YamlValue) -> BouncerResult<Arc<dyn IrcPlugin>> {
    build(cfg, Level::Debug)
}

pub fn create_info(cfg: YamlValue) -> BouncerResult<Arc<dyn IrcPlugin>> {
    build(cfg, Level::Info)
}

pub fn create_warning(cfg: YamlValue) -> BouncerResult<Arc<dyn IrcPlugin>> {
    build(cfg, Level::Warning)
}

pub fn create_error(cfg: YamlValue) -> BouncerResult<Arc<dyn IrcPlugin>> {
    build(cfg, Level::Error)
}

pub struct LogRelay {
    level: Level,
}

impl IrcPlugin for LogRelay {
    fn name(&self) -> &'static str {
        self.level.plugin_name()
    }

    fn init(&self, host: &dyn PluginHost) {
        host.add_relay_exception(BOT_NICK);
    }

    fn fini(&self, host: &dyn PluginHost) {
        host.remove_relay_exception(BOT_NICK);
    }

    fn on_event(&self, host: &dyn PluginHost, event: &str, msg: Option<&IrcMessage>, _client_id: Option<u64>) {
        if event != EVENT_LOG {
            return;
        }
        let Some(msg) = msg else { return };
        let Some(level_name) = msg.params.first() else { return };
        if !self.level.matches(level_name) {
            return;
        }
        let Some(text) = &msg.trailing else { return };
        host.broadcast_to_clients(&format!(
            ":{BOT_NICK}!kalisko@kalisko.proxy PRIVMSG {} :({}) {}",
            host.own_nick(),
            self.level.tag(),
            text
        ));
    }
}
