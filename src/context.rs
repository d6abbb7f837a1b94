//! The capability surface a session needs from a CA protocol client.
//!
//! A protocol client (network transport, name resolution, circuit
//! management) lives behind these traits. Everything it reports comes back
//! through callbacks, which the client is free to run on its own dispatch
//! thread(s), concurrently with the threads that issued the requests.
//!
//! [`crate::loopback::LoopbackContext`] is an in-process implementation.

use std::{fmt, sync::Arc};

use crate::{
    dbr::{Dbr, DbrBasicType, DbrType, DbrValue},
    status::CaStatus,
};

/// A change of connection state of a channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

impl ConnectionEvent {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionEvent::Connected)
    }
}

/// Identifies a registered connection listener, for later removal
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Which changes should trigger a monitor update
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MonitorMask {
    pub value: bool,
    pub log: bool,
    pub alarm: bool,
    pub property: bool,
}

impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask {
            value: true,
            log: false,
            alarm: true,
            property: false,
        }
    }
}

impl fmt::Display for MonitorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags: Vec<&str> = [
            (self.value, "VALUE"),
            (self.log, "LOG"),
            (self.alarm, "ALARM"),
            (self.property, "PROPERTY"),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| *name)
        .collect();
        write!(f, "{}", flags.join("|"))
    }
}

/// Called on every connection state change of a channel
pub type ConnectionListener = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;
/// Called once with the result of a read
pub type GetCallback = Box<dyn FnOnce(Result<Dbr, CaStatus>) + Send>;
/// Called once when the server has finished processing a write
pub type PutCallback = Box<dyn FnOnce(CaStatus) + Send>;
/// Called for every update delivered to a monitor
pub type MonitorCallback = Arc<dyn Fn(Result<Dbr, CaStatus>) + Send + Sync>;

/// A protocol client context, which creates channels
pub trait Context: Send + Sync + 'static {
    type Channel: Channel;

    /// Create a channel to a named PV.
    ///
    /// Creation does not wait for the channel to connect; connection is
    /// reported through [`Channel::add_connection_listener`].
    fn create_channel(&self, name: &str) -> Result<Arc<Self::Channel>, CaStatus>;

    /// Push any queued requests out to the servers
    fn flush_io(&self) -> Result<(), CaStatus>;

    /// Human-readable description of the context and its configuration
    fn describe(&self) -> String {
        String::new()
    }

    /// Release every resource of the context. No further use is valid.
    fn dispose(&self) {}
}

/// One connection to a named PV
pub trait Channel: Send + Sync + 'static {
    type Monitor: MonitorHandle;

    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// The native field type, or `None` if it is not known
    fn native_type(&self) -> Option<DbrBasicType>;

    /// The maximum number of elements the channel can transfer
    fn element_count(&self) -> usize;

    /// Register for connection changes.
    ///
    /// If the channel is already connected the listener receives
    /// [`ConnectionEvent::Connected`] without waiting for a change. That
    /// delivery may happen before this returns, on the calling thread, so
    /// callers must not hold locks the listener takes.
    fn add_connection_listener(&self, listener: ConnectionListener)
    -> Result<ListenerId, CaStatus>;

    fn remove_connection_listener(&self, id: ListenerId);

    /// Request one read of `count` elements as `dbr_type`
    fn get(&self, dbr_type: DbrType, count: usize, on_complete: GetCallback)
    -> Result<(), CaStatus>;

    /// Request a write. With `on_complete` the server acknowledges once the
    /// write has been processed, otherwise the write is fire-and-forget.
    fn put(
        &self,
        dbr_type: DbrType,
        count: usize,
        value: DbrValue,
        on_complete: Option<PutCallback>,
    ) -> Result<(), CaStatus>;

    /// Subscribe to updates of the channel value
    fn add_monitor(
        &self,
        dbr_type: DbrType,
        count: usize,
        mask: MonitorMask,
        on_update: MonitorCallback,
    ) -> Result<Self::Monitor, CaStatus>;

    /// Flush the owning context
    fn flush_io(&self) -> Result<(), CaStatus>;

    fn destroy(&self) -> Result<(), CaStatus>;
}

/// An installed monitor, cancelled with [`MonitorHandle::clear`]
pub trait MonitorHandle: Send + 'static {
    fn clear(&self) -> Result<(), CaStatus>;
}
