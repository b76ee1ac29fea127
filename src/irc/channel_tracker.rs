//! Per-connection channel membership tracking (spec.md §4.5).
//!
//! Channels are added when the bouncer's own nick `JOIN`s and removed
//! when it `PART`s or the upstream connection drops. Bookkeeping never
//! panics on a malformed mask — a message whose prefix fails to parse
//! is simply not attributed to anyone and ignored.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::bus::{Arg, EventArgs, EventBus};
use crate::irc::parser::{parse_user_mask, IrcMessage};

pub const EVENT_CHANNEL_JOIN: &str = "channel_join";
pub const EVENT_CHANNEL_PART: &str = "channel_part";

/// Tracks which channels the bouncer's upstream identity currently
/// occupies, for a single [`crate::irc::IrcConnection`].
pub struct ChannelTracker {
    subject: u64,
    bus: Arc<EventBus>,
    channels: Mutex<BTreeSet<String>>,
}

impl ChannelTracker {
    pub fn new(bus: Arc<EventBus>, subject: u64) -> Self {
        ChannelTracker {
            subject,
            bus,
            channels: Mutex::new(BTreeSet::new()),
        }
    }

    /// Feeds a parsed upstream message through the tracker. Only `JOIN`
    /// and `PART` lines whose prefix nick matches `own_nick` affect
    /// membership; everything else is a no-op.
    pub fn handle_message(&self, msg: &IrcMessage, own_nick: &str) {
        match msg.command.as_str() {
            "JOIN" => self.on_join(msg, own_nick),
            "PART" => self.on_part(msg, own_nick),
            "KICK" => self.on_kick(msg, own_nick),
            _ => {}
        }
    }

    fn on_join(&self, msg: &IrcMessage, own_nick: &str) {
        if !prefix_is(msg, own_nick) {
            return;
        }
        for channel in joined_channels(msg) {
            if self.channels.lock().unwrap().insert(channel.clone()) {
                self.emit(EVENT_CHANNEL_JOIN, channel);
            }
        }
    }

    fn on_part(&self, msg: &IrcMessage, own_nick: &str) {
        if !prefix_is(msg, own_nick) {
            return;
        }
        for channel in joined_channels(msg) {
            if self.channels.lock().unwrap().remove(&channel) {
                self.emit(EVENT_CHANNEL_PART, channel);
            }
        }
    }

    /// A `KICK <channel> <target>` where `target` is our own nick also
    /// removes membership, same as a self-`PART`.
    fn on_kick(&self, msg: &IrcMessage, own_nick: &str) {
        let Some(channel) = msg.params.first() else {
            return;
        };
        let Some(target) = msg.params.get(1) else {
            return;
        };
        if !target.eq_ignore_ascii_case(own_nick) {
            return;
        }
        if self.channels.lock().unwrap().remove(channel) {
            self.emit(EVENT_CHANNEL_PART, channel.clone());
        }
    }

    /// Called when the upstream connection drops: every channel the
    /// connection still held is considered parted.
    pub fn clear(&self) {
        let parted: Vec<String> = self.channels.lock().unwrap().drain().collect();
        for channel in parted {
            self.emit(EVENT_CHANNEL_PART, channel);
        }
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().unwrap().iter().cloned().collect()
    }

    fn emit(&self, event: &str, channel: String) {
        self.bus
            .trigger(Some(self.subject), event, &EventArgs::of(vec![Arg::Text(channel)]));
    }
}

fn prefix_is(msg: &IrcMessage, own_nick: &str) -> bool {
    let Some(prefix) = msg.prefix.as_deref() else {
        return false;
    };
    match parse_user_mask(prefix) {
        Some(mask) => mask.nick.eq_ignore_ascii_case(own_nick),
        None => false,
    }
}

fn joined_channels(msg: &IrcMessage) -> Vec<String> {
    msg.params
        .first()
        .map(|p| p.split(',').map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::parser::parse_message;

    fn tracker() -> ChannelTracker {
        ChannelTracker::new(Arc::new(EventBus::new()), 1)
    }

    #[test]
    fn self_join_adds_channel_and_fires_event() {
        let t = tracker();
        let joined = Arc::new(Mutex::new(Vec::new()));
        let j2 = joined.clone();
        t.bus.attach(
            Some(1),
            EVENT_CHANNEL_JOIN,
            Arc::new(move |args| {
                if let Some(text) = args.get(0).and_then(|a| a.as_text()) {
                    j2.lock().unwrap().push(text.to_string());
                }
            }),
            Default::default(),
        );

        let msg = parse_message(":me!u@h JOIN #rust").unwrap();
        t.handle_message(&msg, "me");

        assert_eq!(t.channels(), vec!["#rust".to_string()]);
        assert_eq!(*joined.lock().unwrap(), vec!["#rust".to_string()]);
    }

    #[test]
    fn others_joining_does_not_affect_tracker() {
        let t = tracker();
        let msg = parse_message(":someoneelse!u@h JOIN #rust").unwrap();
        t.handle_message(&msg, "me");
        assert!(t.channels().is_empty());
    }

    #[test]
    fn self_part_removes_channel() {
        let t = tracker();
        t.handle_message(&parse_message(":me!u@h JOIN #rust").unwrap(), "me");
        t.handle_message(&parse_message(":me!u@h PART #rust").unwrap(), "me");
        assert!(t.channels().is_empty());
    }

    #[test]
    fn comma_separated_join_list() {
        let t = tracker();
        t.handle_message(&parse_message(":me!u@h JOIN #a,#b,#c").unwrap(), "me");
        assert_eq!(t.channels(), vec!["#a", "#b", "#c"]);
    }

    #[test]
    fn kick_of_self_removes_channel() {
        let t = tracker();
        t.handle_message(&parse_message(":me!u@h JOIN #rust").unwrap(), "me");
        t.handle_message(&parse_message(":op!u@h KICK #rust me :bye").unwrap(), "me");
        assert!(t.channels().is_empty());
    }

    #[test]
    fn disconnect_clears_all_channels() {
        let t = tracker();
        t.handle_message(&parse_message(":me!u@h JOIN #a,#b").unwrap(), "me");
        t.clear();
        assert!(t.channels().is_empty());
    }

    #[test]
    fn malformed_prefix_never_panics() {
        let t = tracker();
        let msg = IrcMessage {
            prefix: Some(String::new()),
            command: "JOIN".to_string(),
            params: vec!["#rust".to_string()],
            trailing: None,
            raw: String::new(),
        };
        t.handle_message(&msg, "me");
        assert!(t.channels().is_empty());
    }
}
