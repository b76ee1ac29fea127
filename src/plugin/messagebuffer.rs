//! Buffers `PRIVMSG`/`NOTICE` lines per target while no client is
//! attached and replays them when one reattaches
//! (`irc/bouncers/<name>/messagebuffer`).
//!
//! `specific` lets a target (usually a channel) override the default
//! ring size, matching the per-target override shape described for the
//! config tree in SPEC_FULL.md §2.4. Replay is framed per target with
//! opening/closing markers and timestamped, and the buffer for that
//! target is cleared once replayed — a client that reattaches twice in
//! a row sees each line exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::{IrcPlugin, PluginHost};
use crate::error::{BouncerError, BouncerResult};
use crate::irc::parser::parse_user_mask;
use crate::irc::IrcMessage;

pub const PLUGIN_NAME: &str = "messagebuffer";

#[derive(Debug, Default, Deserialize)]
struct Config {
    #[serde(default = "default_max_lines")]
    max_lines: usize,
    #[serde(default)]
    specific: HashMap<String, usize>,
}

fn default_max_lines() -> usize {
    200
}

struct Buffered {
    from: String,
    command: String,
    text: String,
    at: String,
}

pub struct MessageBuffer {
    default_max: usize,
    overrides: HashMap<String, usize>,
    lines: Mutex<HashMap<String, VecDeque<Buffered>>>,
}

pub fn create(cfg: YamlValue) -> BouncerResult<std::sync::Arc<dyn IrcPlugin>> {
    let config: Config = serde_yaml::from_value(cfg)
        .map_err(|e| BouncerError::Plugin(format!("invalid {PLUGIN_NAME} config: {e}")))?;
    Ok(std::sync::Arc::new(MessageBuffer {
        default_max: config.max_lines,
        overrides: config.specific,
        lines: Mutex::new(HashMap::new()),
    }))
}

impl MessageBuffer {
    fn cap_for(&self, target: &str) -> usize {
        self.overrides.get(target).copied().unwrap_or(self.default_max)
    }
}

impl IrcPlugin for MessageBuffer {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn on_event(&self, host: &dyn PluginHost, event: &str, msg: Option<&IrcMessage>, client_id: Option<u64>) {
        match event {
            "message" => {
                let Some(msg) = msg else { return };
                if msg.command != "PRIVMSG" && msg.command != "NOTICE" {
                    return;
                }
                let Some(target) = msg.params.first() else { return };
                let from = msg
                    .prefix
                    .as_deref()
                    .and_then(parse_user_mask)
                    .map(|m| m.nick)
                    .unwrap_or_else(|| "?".to_string());
                let cap = self.cap_for(target);
                let mut lines = self.lines.lock().unwrap();
                let ring = lines.entry(target.clone()).or_default();
                ring.push_back(Buffered {
                    from,
                    command: msg.command.clone(),
                    text: msg.trailing.clone().unwrap_or_default(),
                    at: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
                });
                while ring.len() > cap {
                    ring.pop_front();
                }
            }
            "bouncer_reattached" => {
                let Some(client_id) = client_id else { return };
                let mut lines = self.lines.lock().unwrap();
                for (target, ring) in lines.iter_mut() {
                    if ring.is_empty() {
                        continue;
                    }
                    host.send_to_client(client_id, &format!("PRIVMSG {target} :Message buffer playback..."));
                    for entry in ring.drain(..) {
                        host.send_to_client(
                            client_id,
                            &format!(
                                ":{}!bouncer@buffer {} {} :[{}] {}",
                                entry.from, entry.command, target, entry.at, entry.text
                            ),
                        );
                    }
                    host.send_to_client(client_id, &format!("PRIVMSG {target} :...buffer playback complete!"));
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::parser::parse_message;
    use std::sync::Mutex as StdMutex;

    struct RecordingHost {
        to_client: StdMutex<Vec<(u64, String)>>,
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
    }

    #[test]
    fn buffers_and_replays_on_attach() {
        let plugin = MessageBuffer {
            default_max: 10,
            overrides: HashMap::new(),
            lines: Mutex::new(HashMap::new()),
        };
        let host = RecordingHost {
            to_client: StdMutex::new(Vec::new()),
        };
        let msg = parse_message(":alice!u@h PRIVMSG #chan :hi there").unwrap();
        plugin.on_event(&host, "message", Some(&msg), None);
        plugin.on_event(&host, "bouncer_reattached", None, Some(3));

        let replies = host.to_client.lock().unwrap();
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|(id, _)| *id == 3));
        assert!(replies[0].1.contains("playback..."));
        assert!(replies[1].1.contains("hi there"));
        assert!(replies[2].1.contains("playback complete!"));
        drop(replies);

        assert!(plugin.lines.lock().unwrap().get("#chan").unwrap().is_empty());
    }

    #[test]
    fn respects_per_target_cap() {
        let mut overrides = HashMap::new();
        overrides.insert("#chan".to_string(), 1);
        let plugin = MessageBuffer {
            default_max: 10,
            overrides,
            lines: Mutex::new(HashMap::new()),
        };
        let host = RecordingHost {
            to_client: StdMutex::new(Vec::new()),
        };
        for text in ["one", "two", "three"] {
            let msg = parse_message(&format!(":a!u@h PRIVMSG #chan :{text}")).unwrap();
            plugin.on_event(&host, "message", Some(&msg), None);
        }
        let lines = plugin.lines.lock().unwrap();
        assert_eq!(lines.get("#chan").unwrap().len(), 1);
        assert_eq!(lines.get("#chan").unwrap().back().unwrap().text, "three");
    }
}
