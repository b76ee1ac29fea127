//! Sends a configured list of raw lines to the upstream once registered
//! (`irc/perform/<name>`), and exposes them to the client through the
//! in-band `*perform` bot (`PRIVMSG *perform :list`).

use serde::Deserialize;
use serde_yaml::Value as YamlValue;

use super::{IrcPlugin, PluginHost};
use crate::error::{BouncerError, BouncerResult};
use crate::irc::IrcMessage;

pub const PLUGIN_NAME: &str = "perform";
pub const BOT_NICK: &str = "*perform";

#[derive(Debug, Default, Deserialize)]
struct Config {
    #[serde(default)]
    commands: Vec<String>,
}

pub fn create(cfg: YamlValue) -> BouncerResult<std::sync::Arc<dyn IrcPlugin>> {
    let config: Config = serde_yaml::from_value(cfg)
        .map_err(|e| BouncerError::Plugin(format!("invalid {PLUGIN_NAME} config: {e}")))?;
    Ok(std::sync::Arc::new(Perform {
        commands: config.commands,
    }))
}

pub struct Perform {
    commands: Vec<String>,
}

impl IrcPlugin for Perform {
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
        match event {
            "registered" => {
                for line in &self.commands {
                    host.send_upstream(line);
                }
            }
            "client_message" => {
                let Some(msg) = msg else { return };
                let Some(client_id) = client_id else { return };
                if msg.command != "PRIVMSG" {
                    return;
                }
                let Some(target) = msg.params.first() else { return };
                if !target.eq_ignore_ascii_case(BOT_NICK) {
                    return;
                }
                if self.commands.is_empty() {
                    host.send_to_client(client_id, &format!(":{BOT_NICK} NOTICE {0} :no perform commands configured", host.own_nick()));
                    return;
                }
                for (idx, line) in self.commands.iter().enumerate() {
                    host.send_to_client(
                        client_id,
                        &format!(":{BOT_NICK} NOTICE {0} :{1}: {2}", host.own_nick(), idx + 1, line),
                    );
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHost {
        upstream: Mutex<Vec<String>>,
        to_client: Mutex<Vec<(u64, String)>>,
    }
    impl PluginHost for RecordingHost {
        fn send_upstream(&self, line: &str) {
            self.upstream.lock().unwrap().push(line.to_string());
        }
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
    }

    #[test]
    fn sends_configured_commands_on_registration() {
        let plugin = Perform {
            commands: vec!["JOIN #home".into(), "MODE me +i".into()],
        };
        let host = RecordingHost {
            upstream: Mutex::new(Vec::new()),
            to_client: Mutex::new(Vec::new()),
        };
        plugin.on_event(&host, "registered", None, None);
        assert_eq!(*host.upstream.lock().unwrap(), vec!["JOIN #home", "MODE me +i"]);
    }

    #[test]
    fn bot_lists_commands_to_requesting_client() {
        let plugin = Perform {
            commands: vec!["JOIN #home".into()],
        };
        let host = RecordingHost {
            upstream: Mutex::new(Vec::new()),
            to_client: Mutex::new(Vec::new()),
        };
        let msg = crate::irc::parser::parse_message("PRIVMSG *perform :list").unwrap();
        plugin.on_event(&host, "client_message", Some(&msg), Some(7));
        let replies = host.to_client.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, 7);
    }
}
