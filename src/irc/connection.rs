//! The single upstream IRC connection (spec.md §4.4, §4.6 boundary).
//!
//! `IrcConnection` owns the socket to the real IRC network, performs the
//! `PASS`/`USER`/`NICK` handshake, answers server `PING`s internally,
//! tracks the bouncer's own nick and channel membership, and throttles
//! outbound lines with a leaky-bucket matching spec.md §4.4 exactly:
//! each line costs `2 + length(line)` units, the bucket drains at 120
//! units/sec, and at most 10 seconds of lookahead (1200 units) may be
//! reserved ahead of the drain.
//!
//! Reconnection itself is passive: [`IrcConnection::reconnect`] just
//! re-runs the same socket-creation step `start` used, and is only ever
//! called by something else (the `keepalive` plugin's `disconnected`
//! handler) deciding it's time to try again. The connection never
//! schedules its own retry.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::bus::{Arg, EventArgs, EventBus, ListenerToken, Priority};
use crate::irc::channel_tracker::ChannelTracker;
use crate::irc::parser::{format_message, parse_message, IrcMessage};
use crate::net::frame::FrameSink;
use crate::net::{Socket, EVENT_CONNECTED, EVENT_DISCONNECT, EVENT_READ, EVENT_SOCKETS_POLLED};

pub const EVENT_MESSAGE: &str = "message";
/// Fires once the upstream handshake completes (numeric `001`). Named
/// for what a listener cares about: the connection is up and nick
/// tracking is current. [`EVENT_RECONNECT`] fires alongside it.
pub const EVENT_REGISTERED: &str = "registered";
/// Fires alongside [`EVENT_REGISTERED`], once per successful
/// (re-)registration — including the very first one. `perform` and
/// `keepalive` key their re-arming off this rather than off
/// `registered` so a future listener that only cares about "the link
/// came back up" doesn't also have to know about the numeric that
/// drives it.
pub const EVENT_RECONNECT: &str = "reconnect";
/// Fires once when the upstream socket drops, before any retry is
/// attempted. `keepalive` is the only built-in listener: it schedules
/// the actual `reconnect()` call after `reconnect_timeout`.
pub const EVENT_DISCONNECTED: &str = "disconnected";

const THROTTLE_RATE_PER_SEC: i64 = 120;
const THROTTLE_LOOKAHEAD_SECS: i64 = 10;
const THROTTLE_CAPACITY: i64 = THROTTLE_RATE_PER_SEC * THROTTLE_LOOKAHEAD_SECS;

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub server: String,
    pub port: u16,
    pub password: Option<String>,
    pub user: String,
    pub real: String,
    pub nick: String,
    pub throttle: bool,
}

struct Throttle {
    bucket: i64,
    last_drain: Instant,
    queue: VecDeque<String>,
}

impl Throttle {
    fn new() -> Self {
        Throttle {
            bucket: 0,
            last_drain: Instant::now(),
            queue: VecDeque::new(),
        }
    }

    fn cost_of(line: &str) -> i64 {
        2 + line.len() as i64
    }

    /// Drains elapsed credit since the last tick. Called once per
    /// `sockets_polled` tick.
    fn age(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_drain).as_secs_f64();
        self.last_drain = now;
        let drained = (elapsed * THROTTLE_RATE_PER_SEC as f64) as i64;
        self.bucket = (self.bucket - drained).max(0);
    }

    fn try_admit(&mut self, cost: i64) -> bool {
        if self.bucket + cost <= THROTTLE_CAPACITY {
            self.bucket += cost;
            true
        } else {
            false
        }
    }
}

pub struct IrcConnection {
    pub subject: u64,
    bus: Arc<EventBus>,
    config: RemoteConfig,
    socket: Mutex<Option<Arc<Socket>>>,
    frame: Mutex<FrameSink>,
    own_nick: Mutex<String>,
    pub channels: Arc<ChannelTracker>,
    throttle: Mutex<Throttle>,
    tick_token: Mutex<Option<ListenerToken>>,
    connect_timeout: Mutex<Duration>,
}

impl IrcConnection {
    pub fn new(bus: Arc<EventBus>, subject: u64, config: RemoteConfig) -> Arc<Self> {
        let channels = Arc::new(ChannelTracker::new(bus.clone(), subject));
        let nick = config.nick.clone();
        Arc::new(IrcConnection {
            subject,
            bus,
            config,
            socket: Mutex::new(None),
            frame: Mutex::new(FrameSink::new()),
            own_nick: Mutex::new(nick),
            channels,
            throttle: Mutex::new(Throttle::new()),
            tick_token: Mutex::new(None),
            connect_timeout: Mutex::new(Duration::from_secs(15)),
        })
    }

    pub fn own_nick(&self) -> String {
        self.own_nick.lock().unwrap().clone()
    }

    /// Hostname of the configured remote, for building masks and
    /// server-sourced replies that should appear to come from upstream.
    pub fn remote_host(&self) -> &str {
        &self.config.server
    }

    pub fn user(&self) -> &str {
        &self.config.user
    }

    pub fn is_connected(&self) -> bool {
        self.socket
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    /// Opens the upstream socket and wires up the listeners that drive
    /// the handshake, message dispatch and throttled drain. Also attaches
    /// the one-time, bus-global `sockets_polled` listener that drives the
    /// throttle drain — `reconnect` must not re-attach this, since it
    /// lives for the lifetime of the connection, not of one socket.
    pub fn start(self: &Arc<Self>, connect_timeout: Duration) {
        *self.connect_timeout.lock().unwrap() = connect_timeout;
        self.connect_socket();

        let weak = Arc::downgrade(self);
        let token = self.bus.attach(
            None,
            EVENT_SOCKETS_POLLED,
            Arc::new(move |_| {
                if let Some(this) = Weak::upgrade(&weak) {
                    this.drain_throttled();
                }
            }),
            Priority::Normal(0),
        );
        *self.tick_token.lock().unwrap() = Some(token);
    }

    /// Re-establishes the upstream socket after a disconnect. A no-op if
    /// already connected. The per-socket listeners (`connected`, `read`,
    /// `disconnect`) are re-attached against the fresh socket's id, since
    /// the old socket's id dies with it.
    pub fn reconnect(self: &Arc<Self>) {
        if self.is_connected() {
            return;
        }
        self.connect_socket();
    }

    fn connect_socket(self: &Arc<Self>) {
        let socket = Socket::create_client(self.bus.clone(), self.config.server.clone(), self.config.port);
        *self.socket.lock().unwrap() = Some(socket.clone());

        let this = self.clone();
        self.bus.attach(
            Some(socket.id),
            EVENT_CONNECTED,
            Arc::new(move |_| this.on_connected()),
            Priority::Normal(0),
        );

        let this = self.clone();
        self.bus.attach(
            Some(socket.id),
            EVENT_READ,
            Arc::new(move |args| {
                if let Some(Arg::Bytes(bytes)) = args.get(0) {
                    this.on_read(bytes);
                }
            }),
            Priority::Normal(0),
        );

        let this = self.clone();
        self.bus.attach(
            Some(socket.id),
            EVENT_DISCONNECT,
            Arc::new(move |_| this.on_disconnect()),
            Priority::Normal(0),
        );

        let timeout = *self.connect_timeout.lock().unwrap();
        socket.connect_async(timeout);
    }

    fn on_connected(self: &Arc<Self>) {
        if let Some(password) = &self.config.password {
            self.send_bypassing_throttle(&format_message(None, "PASS", &[password.clone()], None));
        }
        self.send_bypassing_throttle(&format_message(
            None,
            "USER",
            &[self.config.user.clone(), "0".to_string(), "0".to_string()],
            Some(&self.config.real),
        ));
        self.send_bypassing_throttle(&format_message(None, "NICK", &[self.own_nick()], None));
    }

    fn on_read(self: &Arc<Self>, bytes: &bytes::Bytes) {
        let lines = self.frame.lock().unwrap().ingest(bytes);
        for line in lines {
            let Some(msg) = parse_message(&line) else {
                continue;
            };
            self.dispatch(msg);
        }
    }

    fn dispatch(self: &Arc<Self>, msg: IrcMessage) {
        match msg.command.as_str() {
            "PING" => {
                let token = msg.trailing.clone().or_else(|| msg.params.first().cloned());
                let reply = format_message(None, "PONG", &[], token.as_deref());
                self.send_bypassing_throttle(&reply);
            }
            "001" => {
                if let Some(nick) = msg.params.first() {
                    *self.own_nick.lock().unwrap() = nick.clone();
                }
                self.bus.trigger(Some(self.subject), EVENT_REGISTERED, &EventArgs::new());
                self.bus.trigger(Some(self.subject), EVENT_RECONNECT, &EventArgs::new());
            }
            "NICK" => {
                let own = self.own_nick();
                let is_self = msg
                    .prefix
                    .as_deref()
                    .and_then(crate::irc::parser::parse_user_mask)
                    .map(|m| m.nick.eq_ignore_ascii_case(&own))
                    .unwrap_or(false);
                if is_self {
                    if let Some(new_nick) = msg.params.first() {
                        *self.own_nick.lock().unwrap() = new_nick.clone();
                    }
                }
            }
            _ => {}
        }

        let own = self.own_nick();
        self.channels.handle_message(&msg, &own);
        self.bus
            .trigger(Some(self.subject), EVENT_MESSAGE, &EventArgs::of(vec![Arg::any(msg)]));
    }

    fn on_disconnect(self: &Arc<Self>) {
        self.channels.clear();
        *self.frame.lock().unwrap() = FrameSink::new();
        self.bus.trigger(Some(self.subject), EVENT_DISCONNECTED, &EventArgs::new());
    }

    /// Queues a line for throttled delivery (spec.md §4.4).
    pub fn send(self: &Arc<Self>, line: &str) {
        if !self.config.throttle {
            self.write_line(line);
            return;
        }
        {
            let mut throttle = self.throttle.lock().unwrap();
            throttle.age();
            let cost = Throttle::cost_of(line);
            if throttle.queue.is_empty() && throttle.try_admit(cost) {
                drop(throttle);
                self.write_line(line);
                return;
            }
            throttle.queue.push_back(line.to_string());
        }
    }

    /// Sends immediately, outside the throttle queue. Used for the
    /// registration handshake and `PONG` replies, neither of which are
    /// subject to flood control on the original network protocol.
    fn send_bypassing_throttle(self: &Arc<Self>, line: &str) {
        self.write_line(line);
    }

    fn write_line(&self, line: &str) {
        if let Some(socket) = self.socket.lock().unwrap().as_ref() {
            let mut framed = String::with_capacity(line.len() + 2);
            framed.push_str(line);
            framed.push_str("\r\n");
            socket.write_raw(framed.as_bytes());
        }
    }

    fn drain_throttled(self: &Arc<Self>) {
        loop {
            let next = {
                let mut throttle = self.throttle.lock().unwrap();
                throttle.age();
                let Some(line) = throttle.queue.front().cloned() else {
                    break;
                };
                let cost = Throttle::cost_of(&line);
                if !throttle.try_admit(cost) {
                    break;
                }
                throttle.queue.pop_front();
                line
            };
            self.write_line(&next);
        }
    }

    pub fn disconnect(&self) {
        if let Some(socket) = self.socket.lock().unwrap().take() {
            socket.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_cost_matches_spec_formula() {
        assert_eq!(Throttle::cost_of("PRIVMSG #c :hi"), 2 + 14);
    }

    #[test]
    fn throttle_admits_within_capacity_and_rejects_over() {
        let mut t = Throttle::new();
        assert!(t.try_admit(THROTTLE_CAPACITY));
        assert!(!t.try_admit(1));
    }

    #[test]
    fn throttle_ages_down_over_time() {
        let mut t = Throttle::new();
        t.bucket = THROTTLE_CAPACITY;
        t.last_drain = Instant::now() - Duration::from_secs(1);
        t.age();
        assert_eq!(t.bucket, THROTTLE_CAPACITY - THROTTLE_RATE_PER_SEC);
    }

    #[test]
    fn connection_tracks_registration_nick_change() {
        let bus = Arc::new(EventBus::new());
        let conn = IrcConnection::new(
            bus,
            1,
            RemoteConfig {
                server: "irc.example.org".into(),
                port: 6667,
                password: None,
                user: "bouncer".into(),
                real: "Bouncer".into(),
                nick: "initial".into(),
                throttle: true,
            },
        );
        assert_eq!(conn.own_nick(), "initial");
        let msg = parse_message(":initial!u@h NICK newnick").unwrap();
        conn.dispatch(msg);
        assert_eq!(conn.own_nick(), "newnick");
    }

    #[test]
    fn registration_welcome_updates_nick_and_fires_registered_and_reconnect() {
        let bus = Arc::new(EventBus::new());
        let registered = Arc::new(Mutex::new(false));
        let reconnected = Arc::new(Mutex::new(false));
        let r2 = registered.clone();
        bus.attach(
            Some(1),
            EVENT_REGISTERED,
            Arc::new(move |_| *r2.lock().unwrap() = true),
            Priority::Normal(0),
        );
        let c2 = reconnected.clone();
        bus.attach(
            Some(1),
            EVENT_RECONNECT,
            Arc::new(move |_| *c2.lock().unwrap() = true),
            Priority::Normal(0),
        );
        let conn = IrcConnection::new(
            bus,
            1,
            RemoteConfig {
                server: "irc.example.org".into(),
                port: 6667,
                password: None,
                user: "bouncer".into(),
                real: "Bouncer".into(),
                nick: "initial".into(),
                throttle: false,
            },
        );
        let msg = parse_message(":irc.example.org 001 actualnick :Welcome").unwrap();
        conn.dispatch(msg);
        assert_eq!(conn.own_nick(), "actualnick");
        assert!(*registered.lock().unwrap());
        assert!(*reconnected.lock().unwrap());
    }
}
