//! Event bus (spec.md §4.1): a keyed multi-listener pub/sub multiplexer.
//!
//! Keys are `(subject, event name)` pairs. `subject` is `None` for the
//! global subject and `Some(id)` for a specific entity (socket, IRC
//! connection, proxy, proxy client, ...); entities allocate their id via
//! [`alloc_subject_id`] at construction time.
//!
//! Listeners are attached as `Arc<dyn Fn>` closures rather than raw
//! function pointers plus an untyped `custom_data` pointer (the shape the
//! original module used): a closure already captures whatever context a
//! listener needs, which is the idiomatic replacement noted for the
//! "Polymorphic custom_data" design point. `attach` returns a
//! [`ListenerToken`] that the caller holds onto and later passes to
//! `detach`, standing in for the original's pointer-identity match.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const EVENT_LISTENER_ATTACHED: &str = "listener_attached";
pub const EVENT_LISTENER_DETACHED: &str = "listener_detached";

static NEXT_SUBJECT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh, process-unique subject identity.
pub fn alloc_subject_id() -> u64 {
    NEXT_SUBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

pub type SubjectId = Option<u64>;

/// A single positional event argument. Simple scalars pass through
/// directly; anything structured (an `IrcMessage`, a socket handle, ...)
/// rides in `Any` and is downcast by the listener that knows the event's
/// shape, per the "variadic event arguments" design note.
#[derive(Clone)]
pub enum Arg {
    Unit,
    Int(i64),
    Text(String),
    Bytes(bytes::Bytes),
    Any(Arc<dyn Any + Send + Sync>),
}

impl Arg {
    pub fn any<T: Any + Send + Sync>(value: T) -> Self {
        Arg::Any(Arc::new(value))
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Arg::Any(v) => v.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Arg::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct EventArgs(pub Vec<Arg>);

impl EventArgs {
    pub fn new() -> Self {
        EventArgs(Vec::new())
    }

    pub fn of(args: Vec<Arg>) -> Self {
        EventArgs(args)
    }

    pub fn get(&self, idx: usize) -> Option<&Arg> {
        self.0.get(idx)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Lowest,
    Normal(i32),
    Highest,
}

impl Priority {
    fn rank(self) -> i64 {
        match self {
            Priority::Lowest => i64::MIN,
            Priority::Normal(v) => v as i64,
            Priority::Highest => i64::MAX,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal(0)
    }
}

pub type ListenerFn = Arc<dyn Fn(&EventArgs) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

struct Entry {
    token: ListenerToken,
    listener: ListenerFn,
    priority: Priority,
    seq: u64,
}

/// The event bus. Holds a single mutex over its routing table; critical
/// sections only ever clone the listener list for a key, never invoke a
/// listener while the lock is held, so a listener that calls back into
/// `trigger`/`attach`/`detach` (even for the same key) never deadlocks
/// and always observes its own fresh snapshot.
#[derive(Default)]
pub struct EventBus {
    routes: Mutex<HashMap<(SubjectId, String), Vec<Entry>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            routes: Mutex::new(HashMap::new()),
        }
    }

    pub fn attach(
        &self,
        subject: SubjectId,
        event: &str,
        listener: ListenerFn,
        priority: Priority,
    ) -> ListenerToken {
        let token = ListenerToken(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        let seq = token.0;
        let entry = Entry {
            token,
            listener,
            priority,
            seq,
        };

        {
            let mut routes = self.routes.lock().unwrap();
            let list = routes.entry((subject, event.to_string())).or_default();
            let rank = entry.priority.rank();
            let pos = list
                .iter()
                .position(|e| e.priority.rank() > rank)
                .unwrap_or(list.len());
            list.insert(pos, entry);
        }

        self.trigger(subject, EVENT_LISTENER_ATTACHED, &EventArgs::of(vec![Arg::Text(event.to_string())]));
        token
    }

    /// Removes the first listener registered under `(subject, event)`
    /// whose token matches. Returns whether something was removed.
    pub fn detach(&self, subject: SubjectId, event: &str, token: ListenerToken) -> bool {
        let removed = {
            let mut routes = self.routes.lock().unwrap();
            let key = (subject, event.to_string());
            let mut removed = false;
            if let Some(list) = routes.get_mut(&key) {
                if let Some(idx) = list.iter().position(|e| e.token == token) {
                    list.remove(idx);
                    removed = true;
                }
                if list.is_empty() {
                    routes.remove(&key);
                }
            }
            removed
        };

        if removed {
            self.trigger(subject, EVENT_LISTENER_DETACHED, &EventArgs::of(vec![Arg::Text(event.to_string())]));
        }
        removed
    }

    /// Invokes every listener registered for `(subject, event)` in
    /// priority order against a snapshot taken before any listener runs.
    /// Returns the number of listeners invoked, or `-1` if the key is
    /// unknown (spec.md §8 invariant 3).
    pub fn trigger(&self, subject: SubjectId, event: &str, args: &EventArgs) -> i64 {
        let snapshot: Option<Vec<ListenerFn>> = {
            let routes = self.routes.lock().unwrap();
            routes
                .get(&(subject, event.to_string()))
                .map(|list| list.iter().map(|e| e.listener.clone()).collect())
        };

        match snapshot {
            None => -1,
            Some(listeners) => {
                for listener in &listeners {
                    listener(args);
                }
                listeners.len() as i64
            }
        }
    }

    pub fn listener_count(&self, subject: SubjectId, event: &str) -> usize {
        let routes = self.routes.lock().unwrap();
        routes
            .get(&(subject, event.to_string()))
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn unknown_key_triggers_as_unknown() {
        let bus = EventBus::new();
        assert_eq!(bus.trigger(None, "nope", &EventArgs::new()), -1);
        assert_eq!(bus.listener_count(None, "nope"), 0);
    }

    #[test]
    fn attach_detach_listener_count() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        let token = bus.attach(
            None,
            "ping",
            Arc::new(move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            }),
            Priority::Normal(0),
        );
        assert_eq!(bus.listener_count(None, "ping"), 1);
        assert_eq!(bus.trigger(None, "ping", &EventArgs::new()), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(bus.detach(None, "ping", token));
        assert_eq!(bus.listener_count(None, "ping"), 0);
        assert_eq!(bus.trigger(None, "ping", &EventArgs::new()), -1);
    }

    #[test]
    fn priority_ordering() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let push = |tag: &'static str| {
            let order = order.clone();
            Arc::new(move |_: &EventArgs| order.lock().unwrap().push(tag)) as ListenerFn
        };

        bus.attach(None, "e", push("normal-a"), Priority::Normal(0));
        bus.attach(None, "e", push("highest"), Priority::Highest);
        bus.attach(None, "e", push("lowest"), Priority::Lowest);
        bus.attach(None, "e", push("normal-b"), Priority::Normal(0));

        bus.trigger(None, "e", &EventArgs::new());
        assert_eq!(
            *order.lock().unwrap(),
            vec!["lowest", "normal-a", "normal-b", "highest"]
        );
    }

    #[test]
    fn reentrant_detach_does_not_skip_snapshot() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let bus2 = bus.clone();
        let seen2 = seen.clone();
        // Listener A detaches listener B while the trigger loop is in
        // progress; B must still fire because the snapshot was taken
        // before any listener ran.
        let token_b = Arc::new(Mutex::new(None));
        let token_b2 = token_b.clone();

        bus.attach(
            None,
            "e",
            Arc::new(move |_| {
                if let Some(t) = *token_b2.lock().unwrap() {
                    bus2.detach(None, "e", t);
                }
            }),
            Priority::Normal(-1),
        );

        let seen3 = seen2.clone();
        let tb = bus.attach(
            None,
            "e",
            Arc::new(move |_| seen3.lock().unwrap().push("b")),
            Priority::Normal(0),
        );
        *token_b.lock().unwrap() = Some(tb);

        assert_eq!(bus.trigger(None, "e", &EventArgs::new()), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["b"]);
        assert_eq!(bus.listener_count(None, "e"), 1);
    }
}
