//! Core library for the IRC bouncer runtime.
//!
//! Wires together the event bus, the upstream IRC connection, the
//! client-facing proxy, the plugin manager, and the timer service
//! behind a single per-process [`bus::EventBus`].

pub mod bouncer;
pub mod bus;
pub mod config;
pub mod error;
pub mod irc;
pub mod logging;
pub mod net;
pub mod plugin;
pub mod proxy;
pub mod timer;
