//! Keeps the upstream connection alive and recovers it (spec.md §4.7/§4.8,
//! `irc/keepalive`), grounded on `ircpp_keepalive.c`'s challenge/timeout/
//! reconnect timer cycle.
//!
//! A running cycle is a self-rescheduling chain of
//! [`super::PluginHost::schedule_once`] calls: every `interval`, send a
//! `PING` carrying a fresh challenge string and arm a `timeout` watchdog;
//! a matching `PONG` clears the watchdog, an unanswered one disconnects
//! the upstream socket. `disconnected` arms a single `reconnect_timeout`
//! shot that retries the connect if it's still down. Each cycle is
//! tagged with a generation counter so a disconnect (or plugin
//! `fini`) invalidates any chain links still in flight — `schedule_once`
//! has no cancel, so staleness has to be checked when a link fires
//! instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use serde_yaml::Value as YamlValue;

use super::{IrcPlugin, PluginHost};
use crate::error::{BouncerError, BouncerResult};
use crate::irc::IrcMessage;

pub const PLUGIN_NAME: &str = "keepalive";

fn default_interval() -> u64 {
    120
}

fn default_timeout() -> u64 {
    10
}

fn default_reconnect_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default = "default_interval")]
    interval: u64,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default = "default_reconnect_timeout")]
    reconnect_timeout: u64,
}

pub fn create(cfg: YamlValue) -> BouncerResult<Arc<dyn IrcPlugin>> {
    let config: Config = serde_yaml::from_value(cfg)
        .map_err(|e| BouncerError::Plugin(format!("invalid {PLUGIN_NAME} config: {e}")))?;
    Ok(Arc::new(Keepalive(Arc::new(KeepaliveState {
        interval: Duration::from_secs(config.interval),
        timeout: Duration::from_secs(config.timeout),
        reconnect_timeout: Duration::from_secs(config.reconnect_timeout),
        generation: AtomicU64::new(0),
        expected_challenge: Mutex::new(None),
    }))))
}

struct KeepaliveState {
    interval: Duration,
    timeout: Duration,
    reconnect_timeout: Duration,
    generation: AtomicU64,
    expected_challenge: Mutex<Option<String>>,
}

impl KeepaliveState {
    fn rearm(self: &Arc<Self>, host: &dyn PluginHost) {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let state = self.clone();
        host.schedule_once(
            self.interval,
            Box::new(move |host| state.fire_challenge(host, gen)),
        );
    }

    fn fire_challenge(self: Arc<Self>, host: &dyn PluginHost, gen: u64) {
        if self.generation.load(Ordering::SeqCst) != gen || !host.is_connected() {
            return;
        }

        let challenge = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos().to_string())
            .unwrap_or_else(|_| "0".to_string());
        *self.expected_challenge.lock().unwrap() = Some(challenge.clone());
        host.send_upstream(&format!("PING :{challenge}"));

        let state = self.clone();
        host.schedule_once(self.timeout, Box::new(move |host| state.fire_timeout(host, gen)));

        let state = self.clone();
        host.schedule_once(self.interval, Box::new(move |host| state.fire_challenge(host, gen)));
    }

    fn fire_timeout(self: Arc<Self>, host: &dyn PluginHost, gen: u64) {
        if self.generation.load(Ordering::SeqCst) != gen {
            return;
        }
        if self.expected_challenge.lock().unwrap().take().is_none() {
            return; // already answered
        }
        log::info!("{}: keepalive challenge timed out, disconnecting", host.bouncer_name());
        host.disconnect_upstream();
    }
}

pub struct Keepalive(Arc<KeepaliveState>);

impl IrcPlugin for Keepalive {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn init(&self, host: &dyn PluginHost) {
        if host.is_connected() {
            self.0.rearm(host);
        }
    }

    fn fini(&self, _host: &dyn PluginHost) {
        self.0.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn on_event(&self, host: &dyn PluginHost, event: &str, msg: Option<&IrcMessage>, _client_id: Option<u64>) {
        match event {
            "registered" | "reconnect" => self.0.rearm(host),
            "message" => {
                if let Some(msg) = msg {
                    if msg.command == "PONG" {
                        if let Some(trailing) = &msg.trailing {
                            let mut expected = self.0.expected_challenge.lock().unwrap();
                            if expected.as_deref() == Some(trailing.as_str()) {
                                *expected = None;
                            }
                        }
                    }
                }
            }
            "disconnected" => {
                self.0.generation.fetch_add(1, Ordering::SeqCst);
                host.schedule_once(
                    self.0.reconnect_timeout,
                    Box::new(|host| {
                        if !host.is_connected() {
                            host.reconnect_upstream();
                        }
                    }),
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingHost {
        upstream: StdMutex<Vec<String>>,
        disconnected: StdMutex<bool>,
        connected: StdMutex<bool>,
        scheduled: StdMutex<Vec<(Duration, Box<dyn FnOnce(&dyn PluginHost) + Send>)>>,
    }
    impl PluginHost for RecordingHost {
        fn send_upstream(&self, line: &str) {
            self.upstream.lock().unwrap().push(line.to_string());
        }
        fn send_to_client(&self, _client_id: u64, _line: &str) {}
        fn broadcast_to_clients(&self, _line: &str) {}
        fn own_nick(&self) -> String {
            "bot".into()
        }
        fn bouncer_name(&self) -> &str {
            "test"
        }
        fn is_connected(&self) -> bool {
            *self.connected.lock().unwrap()
        }
        fn disconnect_upstream(&self) {
            *self.disconnected.lock().unwrap() = true;
        }
        fn schedule_once(&self, after: Duration, callback: Box<dyn FnOnce(&dyn PluginHost) + Send>) {
            self.scheduled.lock().unwrap().push((after, callback));
        }
    }

    fn host(connected: bool) -> RecordingHost {
        RecordingHost {
            upstream: StdMutex::new(Vec::new()),
            disconnected: StdMutex::new(false),
            connected: StdMutex::new(connected),
            scheduled: StdMutex::new(Vec::new()),
        }
    }

    #[test]
    fn registered_arms_first_challenge() {
        let state = Arc::new(KeepaliveState {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            reconnect_timeout: Duration::from_secs(1),
            generation: AtomicU64::new(0),
            expected_challenge: Mutex::new(None),
        });
        let plugin = Keepalive(state);
        let host = host(true);
        plugin.on_event(&host, "registered", None, None);
        assert_eq!(host.scheduled.lock().unwrap().len(), 1);
    }

    #[test]
    fn unanswered_challenge_disconnects() {
        let state = Arc::new(KeepaliveState {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            reconnect_timeout: Duration::from_secs(1),
            generation: AtomicU64::new(1),
            expected_challenge: Mutex::new(Some("abc".to_string())),
        });
        let host = host(true);
        state.fire_timeout(&host, 1);
        assert!(*host.disconnected.lock().unwrap());
    }

    #[test]
    fn matching_pong_clears_challenge_and_prevents_disconnect() {
        let state = Arc::new(KeepaliveState {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            reconnect_timeout: Duration::from_secs(1),
            generation: AtomicU64::new(1),
            expected_challenge: Mutex::new(None),
        });
        let plugin = Keepalive(state.clone());
        *state.expected_challenge.lock().unwrap() = Some("abc".to_string());
        let pong = crate::irc::parser::parse_message("PONG :abc").unwrap();
        let host = host(true);
        plugin.on_event(&host, "message", Some(&pong), None);
        assert!(state.expected_challenge.lock().unwrap().is_none());

        state.fire_timeout(&host, 1);
        assert!(!*host.disconnected.lock().unwrap());
    }

    #[test]
    fn disconnected_schedules_reconnect_attempt() {
        let state = Arc::new(KeepaliveState {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            reconnect_timeout: Duration::from_secs(5),
            generation: AtomicU64::new(0),
            expected_challenge: Mutex::new(None),
        });
        let plugin = Keepalive(state);
        let host = host(false);
        plugin.on_event(&host, "disconnected", None, None);
        assert_eq!(host.scheduled.lock().unwrap().len(), 1);
        assert_eq!(host.scheduled.lock().unwrap()[0].0, Duration::from_secs(5));
    }
}
