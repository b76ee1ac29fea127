pub mod channel_tracker;
pub mod connection;
pub mod parser;

pub use channel_tracker::ChannelTracker;
pub use connection::{IrcConnection, RemoteConfig};
pub use parser::{IrcMessage, IrcUserMask};
