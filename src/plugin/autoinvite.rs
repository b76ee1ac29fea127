//! Auto-joins channels the bouncer's identity is `INVITE`d to.

use serde::Deserialize;
use serde_yaml::Value as YamlValue;

use super::{IrcPlugin, PluginHost};
use crate::error::{BouncerError, BouncerResult};
use crate::irc::IrcMessage;

pub const PLUGIN_NAME: &str = "autoinvite";

#[derive(Debug, Default, Deserialize)]
struct Config {}

pub fn create(cfg: YamlValue) -> BouncerResult<std::sync::Arc<dyn IrcPlugin>> {
    let _: Config = serde_yaml::from_value(cfg)
        .map_err(|e| BouncerError::Plugin(format!("invalid {PLUGIN_NAME} config: {e}")))?;
    Ok(std::sync::Arc::new(AutoInvite))
}

pub struct AutoInvite;

impl IrcPlugin for AutoInvite {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn on_event(&self, host: &dyn PluginHost, event: &str, msg: Option<&IrcMessage>, _client_id: Option<u64>) {
        if event != "message" {
            return;
        }
        let Some(msg) = msg else { return };
        if msg.command != "INVITE" {
            return;
        }
        let Some(target_nick) = msg.params.first() else {
            return;
        };
        if !target_nick.eq_ignore_ascii_case(&host.own_nick()) {
            return;
        }
        let Some(channel) = msg.params.get(1).cloned().or_else(|| msg.trailing.clone()) else {
            return;
        };
        host.send_upstream(&format!("JOIN {channel}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::parser::parse_message;
    use std::sync::Mutex;

    struct RecordingHost(Mutex<Vec<String>>);
    impl PluginHost for RecordingHost {
        fn send_upstream(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
        fn send_to_client(&self, _client_id: u64, _line: &str) {}
        fn broadcast_to_clients(&self, _line: &str) {}
        fn own_nick(&self) -> String {
            "bouncer".into()
        }
        fn bouncer_name(&self) -> &str {
            "test"
        }
    }

    #[test]
    fn joins_on_invite_to_self() {
        let plugin = AutoInvite;
        let host = RecordingHost(Mutex::new(Vec::new()));
        let msg = parse_message(":friend!u@h INVITE bouncer #newchan").unwrap();
        plugin.on_event(&host, "message", Some(&msg), None);
        assert_eq!(host.0.lock().unwrap().as_slice(), ["JOIN #newchan"]);
    }

    #[test]
    fn ignores_invite_to_someone_else() {
        let plugin = AutoInvite;
        let host = RecordingHost(Mutex::new(Vec::new()));
        let msg = parse_message(":friend!u@h INVITE someoneelse #newchan").unwrap();
        plugin.on_event(&host, "message", Some(&msg), None);
        assert!(host.0.lock().unwrap().is_empty());
    }
}
