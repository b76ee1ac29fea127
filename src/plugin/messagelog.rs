//! Logs `PRIVMSG` traffic to the filesystem, one file per target
//! (`irc/bouncers/<name>/plugins/messagelog`).
//!
//! Grounded on `ircpp_messagelog.c`: both directions are logged — lines
//! the upstream sends down and lines a client sends up — to
//! `<root>/<proxy_name>/<target>.log`, timestamped, target lowercased
//! and filesystem-sanitised. A `PRIVMSG` addressed directly at the
//! bouncer's own nick (a query, not a channel) logs under the sender's
//! nick instead of the bouncer's own. Targets registered as relay
//! exceptions (in-band bots) are never logged.

use std::path::PathBuf;

use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::{IrcPlugin, PluginHost};
use crate::error::{BouncerError, BouncerResult};
use crate::irc::parser::parse_user_mask;
use crate::irc::IrcMessage;

pub const PLUGIN_NAME: &str = "messagelog";

fn default_root() -> String {
    ".".to_string()
}

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default = "default_root")]
    root: String,
}

impl Default for Config {
    fn default() -> Self {
        Config { root: default_root() }
    }
}

pub fn create(cfg: YamlValue) -> BouncerResult<std::sync::Arc<dyn IrcPlugin>> {
    let config: Config = serde_yaml::from_value(cfg)
        .map_err(|e| BouncerError::Plugin(format!("invalid {PLUGIN_NAME} config: {e}")))?;
    Ok(std::sync::Arc::new(MessageLog { root: config.root }))
}

pub struct MessageLog {
    root: String,
}

impl MessageLog {
    fn log_line(&self, host: &dyn PluginHost, target: &str, nick: &str, text: &str) {
        if host.is_relay_exception(target) {
            return;
        }
        let target_file = sanitize_filename(&target.to_ascii_lowercase());
        let path: PathBuf = [self.root.as_str(), host.bouncer_name(), &format!("{target_file}.log")]
            .iter()
            .collect();
        let line = format!(
            "[{}] <{}> {}\n",
            OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            nick,
            text
        );
        tokio::spawn(async move {
            if let Some(dir) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(dir).await {
                    log::warn!("messagelog: failed to create {}: {e}", dir.display());
                    return;
                }
            }
            let result = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await;
            match result {
                Ok(mut file) => {
                    use tokio::io::AsyncWriteExt;
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        log::warn!("messagelog: failed to write {}: {e}", path.display());
                    }
                }
                Err(e) => log::warn!("messagelog: failed to open {}: {e}", path.display()),
            }
        });
    }
}

impl IrcPlugin for MessageLog {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn on_event(&self, host: &dyn PluginHost, event: &str, msg: Option<&IrcMessage>, _client_id: Option<u64>) {
        let Some(msg) = msg else { return };
        if msg.command != "PRIVMSG" {
            return;
        }
        let Some(target) = msg.params.first() else { return };
        let Some(text) = &msg.trailing else { return };

        match event {
            "message" => {
                let sender = msg
                    .prefix
                    .as_deref()
                    .and_then(parse_user_mask)
                    .map(|m| m.nick)
                    .unwrap_or_else(|| "?".to_string());
                let is_query = target.eq_ignore_ascii_case(&host.own_nick());
                let log_target = if is_query { sender.clone() } else { target.clone() };
                self.log_line(host, &log_target, &sender, text);
            }
            "client_message" => {
                self.log_line(host, target, &host.own_nick(), text);
            }
            _ => {}
        }
    }
}

/// Replaces anything that isn't alphanumeric, `-`, or `_` with `_`,
/// matching the teacher's filename-safety convention elsewhere in the
/// config/plugin layers.
fn sanitize_filename(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
