//! Plugin manager (spec.md §4.7): per-proxy pluggable behavior hung off
//! the event bus.
//!
//! Grounded on the teacher's `PLUGIN_BUILDER_REGISTRY` /
//! `build_plugin(name, cfg)` / `ProxyPluginExecutor` shape
//! (`proxy/plugin/mod.rs`, `proxy/plugin.rs`): a static registry maps a
//! plugin name to a builder closure taking a `serde_yaml::Value`
//! config, and a per-proxy executor holds the enabled plugins in
//! priority order and fans every relevant bus event out to each of
//! them. The HTTP request/response phases the teacher's trait exposes
//! don't apply here, so the single phase becomes "an event happened on
//! this proxy's upstream connection or one of its clients."

pub mod autoinvite;
pub mod botcommand;
pub mod keepalive;
pub mod logrelay;
pub mod lua;
pub mod messagebuffer;
pub mod messagelog;
pub mod perform;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_yaml::Value as YamlValue;

use crate::error::{BouncerError, BouncerResult};
use crate::irc::IrcMessage;

/// Everything a plugin needs to act: send upstream, reply to the
/// client that triggered it, or broadcast to every attached client.
/// Implemented by the proxy that owns the plugin executor.
pub trait PluginHost: Send + Sync {
    fn send_upstream(&self, line: &str);
    fn send_to_client(&self, client_id: u64, line: &str);
    fn broadcast_to_clients(&self, line: &str);
    fn own_nick(&self) -> String;
    fn bouncer_name(&self) -> &str;

    /// Names of the plugins currently enabled on this proxy.
    fn plugin_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Queues a plugin to be enabled once the current event dispatch
    /// finishes — enabling synchronously from inside a plugin's own
    /// `on_event` would re-enter the executor it is being iterated
    /// from.
    fn request_plugin_load(&self, _name: &str, _cfg: YamlValue) {}

    /// Queues a plugin to be disabled once the current dispatch
    /// finishes, for the same reason as [`PluginHost::request_plugin_load`].
    fn request_plugin_unload(&self, _name: &str) {}

    /// Whether the upstream connection is currently established.
    fn is_connected(&self) -> bool {
        true
    }

    /// Drops the upstream connection. `keepalive` calls this when a
    /// challenge `PING` goes unanswered.
    fn disconnect_upstream(&self) {}

    /// Re-establishes the upstream connection if it is currently down.
    /// `keepalive` calls this after `reconnect_timeout` has passed since
    /// a disconnect.
    fn reconnect_upstream(&self) {}

    /// Registers `target` (usually a bot nick) as exempt from the
    /// normal client-to-upstream relay — messages addressed to it are
    /// intercepted by plugins instead of being forwarded. In-band bots
    /// call this from `init` and [`PluginHost::remove_relay_exception`]
    /// from `fini`, the same reference-counted registration the
    /// original `addIrcProxyRelayException`/`delIrcProxyRelayException`
    /// pair provide.
    fn add_relay_exception(&self, _target: &str) {}

    /// Reverses [`PluginHost::add_relay_exception`].
    fn remove_relay_exception(&self, _target: &str) {}

    /// Whether `target` is currently a relay exception.
    fn is_relay_exception(&self, _target: &str) -> bool {
        false
    }

    /// Schedules `callback` to run once after `after`, with the host
    /// passed back in. A plugin only ever borrows `&dyn PluginHost` for
    /// the duration of one `on_event` call, so it cannot stash it into
    /// a `'static` timer closure itself — the host (which does own a
    /// `'static` handle to itself) does that on the plugin's behalf.
    fn schedule_once(&self, _after: Duration, _callback: Box<dyn FnOnce(&dyn PluginHost) + Send>) {}
}

/// A single plugin instance. All hooks default to no-ops, matching the
/// teacher's `ProxyPlugin` default-method shape — a plugin overrides
/// only what it cares about.
pub trait IrcPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> i32 {
        0
    }

    /// Called once when the plugin is enabled on a proxy.
    fn init(&self, _host: &dyn PluginHost) {}

    /// Called once when the plugin is disabled or the proxy tears down.
    fn fini(&self, _host: &dyn PluginHost) {}

    /// Called for every bus event the manager forwards: upstream
    /// messages (`event == "message"`), lifecycle events
    /// (`"registered"`, `"reconnect"`, `"channel_join"`,
    /// `"channel_part"`), and the `"sockets_polled"` tick. `msg` is
    /// `Some` only for `"message"`; `client_id` is `Some` only when the
    /// event originated from a specific downstream client.
    fn on_event(&self, _host: &dyn PluginHost, _event: &str, _msg: Option<&IrcMessage>, _client_id: Option<u64>) {}
}

pub type PluginCreateFn = Arc<dyn Fn(YamlValue) -> BouncerResult<Arc<dyn IrcPlugin>> + Send + Sync>;

static PLUGIN_BUILDER_REGISTRY: Lazy<HashMap<&'static str, PluginCreateFn>> = Lazy::new(|| {
    let arr: Vec<(&str, PluginCreateFn)> = vec![
        (keepalive::PLUGIN_NAME, Arc::new(keepalive::create)),
        (autoinvite::PLUGIN_NAME, Arc::new(autoinvite::create)),
        (perform::PLUGIN_NAME, Arc::new(perform::create)),
        (messagebuffer::PLUGIN_NAME, Arc::new(messagebuffer::create)),
        (messagelog::PLUGIN_NAME, Arc::new(messagelog::create)),
        (botcommand::PLUGIN_NAME, Arc::new(botcommand::create)),
        (lua::PLUGIN_NAME, Arc::new(lua::create)),
        (logrelay::PLUGIN_NAME_DEBUG, Arc::new(logrelay::create_debug)),
        (logrelay::PLUGIN_NAME_INFO, Arc::new(logrelay::create_info)),
        (logrelay::PLUGIN_NAME_WARNING, Arc::new(logrelay::create_warning)),
        (logrelay::PLUGIN_NAME_ERROR, Arc::new(logrelay::create_error)),
    ];
    arr.into_iter().collect()
});

pub fn build_plugin(name: &str, cfg: YamlValue) -> BouncerResult<Arc<dyn IrcPlugin>> {
    let builder = PLUGIN_BUILDER_REGISTRY
        .get(name)
        .ok_or_else(|| BouncerError::Plugin(format!("unknown plugin type: {name}")))?;
    builder(cfg)
}

pub fn known_plugin_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = PLUGIN_BUILDER_REGISTRY.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Holds the plugins enabled for one proxy, sorted by priority, and
/// fans bus events out to each of them in order. Mirrors the teacher's
/// `ProxyPluginExecutor` (`proxy/plugin.rs`).
#[derive(Default)]
pub struct PluginExecutor {
    plugins: Vec<Arc<dyn IrcPlugin>>,
}

impl PluginExecutor {
    pub fn new() -> Self {
        PluginExecutor { plugins: Vec::new() }
    }

    pub fn enable(&mut self, plugin: Arc<dyn IrcPlugin>, host: &dyn PluginHost) {
        plugin.init(host);
        let pos = self
            .plugins
            .iter()
            .position(|p| p.priority() > plugin.priority())
            .unwrap_or(self.plugins.len());
        self.plugins.insert(pos, plugin);
    }

    pub fn disable(&mut self, name: &str, host: &dyn PluginHost) -> bool {
        if let Some(idx) = self.plugins.iter().position(|p| p.name() == name) {
            let plugin = self.plugins.remove(idx);
            plugin.fini(host);
            true
        } else {
            false
        }
    }

    pub fn enabled_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Clones the current plugin list (cheap `Arc` bumps) so a caller
    /// can dispatch an event without holding the executor's lock for
    /// the duration — see `IrcProxy::dispatch_event`.
    pub fn plugins_snapshot(&self) -> Vec<Arc<dyn IrcPlugin>> {
        self.plugins.clone()
    }

    pub fn dispatch(&self, host: &dyn PluginHost, event: &str, msg: Option<&IrcMessage>, client_id: Option<u64>) {
        for plugin in &self.plugins {
            plugin.on_event(host, event, msg, client_id);
        }
    }

    pub fn fini_all(&mut self, host: &dyn PluginHost) {
        for plugin in self.plugins.drain(..) {
            plugin.fini(host);
        }
    }
}
