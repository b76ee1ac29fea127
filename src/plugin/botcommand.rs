//! The `*plugin` bot: `PRIVMSG *plugin :list|help|load <name>|unload <name>`.
//!
//! `load`/`unload` are queued through [`PluginHost::request_plugin_load`]
//! / [`PluginHost::request_plugin_unload`] rather than applied directly,
//! since this plugin's own `on_event` runs from inside the executor's
//! dispatch loop and mutating that same executor mid-iteration would be
//! a reentrant borrow.

use serde::Deserialize;
use serde_yaml::Value as YamlValue;

use super::{IrcPlugin, PluginHost};
use crate::error::{BouncerError, BouncerResult};
use crate::irc::IrcMessage;

pub const PLUGIN_NAME: &str = "botcommand";
pub const BOT_NICK: &str = "*plugin";

#[derive(Debug, Default, Deserialize)]
struct Config {}

pub fn create(cfg: YamlValue) -> BouncerResult<std::sync::Arc<dyn IrcPlugin>> {
    let _: Config = serde_yaml::from_value(cfg)
        .map_err(|e| BouncerError::Plugin(format!("invalid {PLUGIN_NAME} config: {e}")))?;
    Ok(std::sync::Arc::new(BotCommand))
}

pub struct BotCommand;

impl IrcPlugin for BotCommand {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn init(&self, host: &dyn PluginHost) {
        host.add_relay_exception(BOT_NICK);
    }

    fn fini(&self, host: &dyn PluginHost) {
        host.remove_relay_exception(BOT_NICK);
    }

    fn on_event(&self, host: &dyn PluginHost, event: &str, msg: Option<&IrcMessage>, client_id: Option<u64>) {
        if event != "client_message" {
            return;
        }
        let Some(msg) = msg else { return };
        let Some(client_id) = client_id else { return };
        if msg.command != "PRIVMSG" {
            return;
        }
        let Some(target) = msg.params.first() else { return };
        if !target.eq_ignore_ascii_case(BOT_NICK) {
            return;
        }
        let Some(request) = msg.trailing.as_deref() else { return };
        let mut words = request.split_whitespace();
        let nick = host.own_nick();

        match words.next() {
            Some("list") => {
                let enabled = host.plugin_names().join(", ");
                host.send_to_client(client_id, &format!(":{BOT_NICK} NOTICE {nick} :enabled: {enabled}"));
            }
            Some("help") => {
                host.send_to_client(
                    client_id,
                    &format!(":{BOT_NICK} NOTICE {nick} :commands: list, load <name>, unload <name>"),
                );
            }
            Some("load") => match words.next() {
                Some(name) => {
                    host.request_plugin_load(name, YamlValue::Null);
                    host.send_to_client(client_id, &format!(":{BOT_NICK} NOTICE {nick} :queued load of {name}"));
                }
                None => host.send_to_client(client_id, &format!(":{BOT_NICK} NOTICE {nick} :usage: load <name>")),
            },
            Some("unload") => match words.next() {
                Some(name) => {
                    host.request_plugin_unload(name);
                    host.send_to_client(client_id, &format!(":{BOT_NICK} NOTICE {nick} :queued unload of {name}"));
                }
                None => host.send_to_client(client_id, &format!(":{BOT_NICK} NOTICE {nick} :usage: unload <name>")),
            },
            _ => {
                host.send_to_client(client_id, &format!(":{BOT_NICK} NOTICE {nick} :unknown command, try help"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::parser::parse_message;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHost {
        to_client: Mutex<Vec<(u64, String)>>,
        loads: Mutex<Vec<String>>,
        unloads: Mutex<Vec<String>>,
    }
    impl PluginHost for RecordingHost {
        fn send_upstream(&self, _line: &str) {}
        fn send_to_client(&self, client_id: u64, line: &str) {
            self.to_client.lock().unwrap().push((client_id, line.to_string()));
        }
        fn broadcast_to_clients(&self, _line: &str) {}
        fn own_nick(&self) -> String {
            "me".into()
        }
        fn bouncer_name(&self) -> &str {
            "test"
        }
        fn plugin_names(&self) -> Vec<&'static str> {
            vec!["keepalive", "perform"]
        }
        fn request_plugin_load(&self, name: &str, _cfg: YamlValue) {
            self.loads.lock().unwrap().push(name.to_string());
        }
        fn request_plugin_unload(&self, name: &str) {
            self.unloads.lock().unwrap().push(name.to_string());
        }
    }

    #[test]
    fn list_reports_enabled_plugins() {
        let plugin = BotCommand;
        let host = RecordingHost::default();
        let msg = parse_message("PRIVMSG *plugin :list").unwrap();
        plugin.on_event(&host, "client_message", Some(&msg), Some(1));
        assert!(host.to_client.lock().unwrap()[0].1.contains("keepalive, perform"));
    }

    #[test]
    fn load_and_unload_are_queued_not_applied_immediately() {
        let plugin = BotCommand;
        let host = RecordingHost::default();
        let msg = parse_message("PRIVMSG *plugin :load autoinvite").unwrap();
        plugin.on_event(&host, "client_message", Some(&msg), Some(1));
        assert_eq!(*host.loads.lock().unwrap(), vec!["autoinvite"]);

        let msg = parse_message("PRIVMSG *plugin :unload autoinvite").unwrap();
        plugin.on_event(&host, "client_message", Some(&msg), Some(1));
        assert_eq!(*host.unloads.lock().unwrap(), vec!["autoinvite"]);
    }
}
