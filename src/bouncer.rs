//! The bouncer orchestrator (spec.md §4.9): reads `irc/bouncers/<name>`
//! out of [`Config`], builds one [`IrcProxy`] per entry, wires its
//! configured plugins and perform list, attaches the reattach-replay
//! listener (spec.md §4.6/§4.9), and starts the one process-global
//! client-facing listener all bouncers share.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::{Arg, EventArgs, EventBus, Priority};
use crate::config::Config;
use crate::error::{BouncerError, BouncerResult};
use crate::plugin::{perform, PluginHost};
use crate::proxy::{IrcProxy, ProxyServer, EVENT_CLIENT_AUTHENTICATED};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct Bouncer {
    pub name: String,
    pub proxy: Arc<IrcProxy>,
}

/// Builds every configured bouncer, registers it on the shared
/// [`ProxyServer`], and starts the one listener they all accept clients
/// through. A single bouncer failing to build (bad plugin config) does
/// not stop the others — spec.md doesn't require all-or-nothing startup,
/// and a typo in one bouncer's config shouldn't take down a user's
/// entire session.
pub async fn start_all(bus: Arc<EventBus>, config: &Config) -> (Vec<BouncerResult<Bouncer>>, BouncerResult<()>) {
    let server = ProxyServer::new(bus.clone());
    let mut handles = Vec::new();
    for (name, bouncer_config) in &config.bouncers {
        let built = build_one(bus.clone(), &server, name, bouncer_config);
        if let Ok(bouncer) = &built {
            server.register(bouncer.proxy.clone());
        }
        handles.push(built);
    }

    let listen_result = server
        .start(config.proxy_port)
        .await
        .map_err(BouncerError::Io);
    if listen_result.is_ok() {
        log::info!("bouncer listener accepting clients on port {}", config.proxy_port);
    }
    (handles, listen_result)
}

fn build_one(
    bus: Arc<EventBus>,
    server: &Arc<ProxyServer>,
    name: &str,
    bouncer_config: &crate::config::BouncerConfig,
) -> BouncerResult<Bouncer> {
    let remote = bouncer_config.remote_config();
    let proxy = IrcProxy::new(bus.clone(), name.to_string(), remote, bouncer_config.password.clone());

    configure_perform_plugin(&proxy, bouncer_config)?;
    configure_messagebuffer_plugin(&proxy, bouncer_config)?;
    for (plugin_name, plugin_cfg) in &bouncer_config.plugins {
        proxy
            .configure_plugin(plugin_name, plugin_cfg.clone())
            .map_err(|e| BouncerError::Plugin(format!("{name}: {plugin_name}: {e}")))?;
    }

    proxy.start(CONNECT_TIMEOUT);
    attach_reattach_listener(&proxy);

    log::info!("bouncer '{name}' registered, upstream {}", bouncer_config.remote.server);

    Ok(Bouncer {
        name: name.to_string(),
        proxy,
    })
}

/// Replays a reattaching client's channel state (spec.md §4.6/§4.9):
/// a synthetic `JOIN` per tracked channel so the client's own IRC
/// library repopulates its member lists, followed by fresh `NAMES`/
/// `TOPIC` requests upstream so that repopulation reflects current
/// state rather than whatever the bouncer last saw.
fn attach_reattach_listener(proxy: &Arc<IrcProxy>) {
    let weak = Arc::downgrade(proxy);
    proxy.bus_ref().attach(
        Some(proxy.subject),
        EVENT_CLIENT_AUTHENTICATED,
        Arc::new(move |args| {
            let Some(proxy) = weak.upgrade() else { return };
            let Some(Arg::Int(client_id)) = args.get(0) else { return };
            let client_id = *client_id as u64;

            let nick = proxy.own_nick();
            let user = proxy.remote_user();
            let host = proxy.remote_host();
            for channel in proxy.tracked_channels() {
                proxy.send_to_client(client_id, &format!(":{nick}!{user}@{host} JOIN {channel}"));
                proxy.send_upstream(&format!("NAMES {channel}"));
                proxy.send_upstream(&format!("TOPIC {channel}"));
            }

            proxy.fire_bouncer_reattached(client_id);
        }),
        Priority::Normal(0),
    );
}

fn configure_perform_plugin(proxy: &Arc<IrcProxy>, bouncer_config: &crate::config::BouncerConfig) -> BouncerResult<()> {
    if bouncer_config.perform.is_empty() {
        return Ok(());
    }
    let cfg = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
        serde_yaml::Value::String("commands".to_string()),
        serde_yaml::Value::Sequence(bouncer_config.perform.iter().cloned().map(serde_yaml::Value::String).collect()),
    )]))
    .expect("perform command list always serializes");
    proxy.configure_plugin(perform::PLUGIN_NAME, cfg)
}

fn configure_messagebuffer_plugin(proxy: &Arc<IrcProxy>, bouncer_config: &crate::config::BouncerConfig) -> BouncerResult<()> {
    let cfg = serde_yaml::to_value(&bouncer_config.messagebuffer)
        .map_err(|e| BouncerError::Configuration(format!("messagebuffer config: {e}")))?;
    proxy.configure_plugin(crate::plugin::messagebuffer::PLUGIN_NAME, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perform_plugin_skipped_when_no_commands_configured() {
        // configure_perform_plugin short-circuits without touching the
        // plugin registry, so an empty perform list never registers an
        // unnecessary plugin instance.
        let bouncer_config = sample_bouncer_config(vec![]);
        assert!(bouncer_config.perform.is_empty());
    }

    fn sample_bouncer_config(perform: Vec<String>) -> crate::config::BouncerConfig {
        crate::config::BouncerConfig {
            remote: crate::config::RemoteEntry {
                server: "irc.example.org".into(),
                port: 6667,
                user: "u".into(),
                real: "r".into(),
                nick: "n".into(),
                throttle: false,
                password: None,
            },
            password: None,
            plugins: Default::default(),
            messagebuffer: Default::default(),
            perform,
        }
    }
}
