//! Persistent monitors of a PV.
//!
//! A [`Subscription`] stays alive across disconnections of its channel. Each
//! time the channel connects, a monitor is installed for value and alarm
//! updates; each time it disconnects, the monitor is released and a synthetic
//! envelope with `INVALID` severity is delivered in its place. Only
//! [`Subscription::close`] ends it.
//!
//! Updates are kept in a bounded queue holding the most recent envelopes,
//! and handed to every registered listener in the order they arrived.

use std::{
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, debug_span, trace, warn};

use crate::{
    context::{Channel, ConnectionEvent, ConnectionListener, ListenerId, MonitorHandle, MonitorMask},
    dbr::{Dbr, promote},
    envelope::Envelope,
    error::{Error, Result},
    status::CaStatus,
};

/// Default time [`Subscription::wait`] blocks for
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

type Listener = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Identifies a listener added with [`Subscription::add_listener`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

struct State<M> {
    queue: VecDeque<Envelope>,
    capacity: usize,
    timeout: Option<Duration>,
    last: Option<Envelope>,
    listeners: Vec<(ListenerKey, Listener)>,
    next_key: u64,
    monitor: Option<M>,
    closed: bool,
}

/// State reachable from protocol callbacks. Callbacks never hold the
/// [`Subscription`] itself; closing marks this state dead instead.
struct Shared<M> {
    name: String,
    state: Mutex<State<M>>,
    arrived: Condvar,
}

impl<M: MonitorHandle> Shared<M> {
    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Queue an envelope and hand it to the listeners.
    ///
    /// An envelope stamped earlier than the last one delivered is restamped
    /// with that time, so timestamps never go backwards.
    fn deliver(&self, envelope: Envelope) {
        let (envelope, listeners): (Envelope, Vec<Listener>) = {
            let mut state = self.state.lock();
            if state.closed {
                trace!("Dropping update for closed subscription '{}'", self.name);
                return;
            }
            let envelope = match &state.last {
                Some(last) if envelope.timestamp() < last.timestamp() => {
                    trace!("Restamping out of order update for '{}'", self.name);
                    envelope.not_before(last.timestamp())
                }
                _ => envelope,
            };
            while state.queue.len() >= state.capacity {
                state.queue.pop_front();
            }
            state.queue.push_back(envelope.clone());
            state.last = Some(envelope.clone());
            let listeners = state.listeners.iter().map(|(_, l)| l.clone()).collect();
            (envelope, listeners)
        };
        self.arrived.notify_all();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&envelope))).is_err() {
                warn!("Unhandled panic in listener for '{}'", self.name);
            }
        }
    }

    /// Stand in for the updates that stop arriving while disconnected
    fn deliver_disconnect(&self) {
        let last = self.state.lock().last.clone();
        if let Some(last) = last {
            self.deliver(Envelope::disconnected_after(&last));
        }
    }

    fn on_update(&self, update: Result<Dbr, CaStatus>) {
        match update {
            Ok(dbr) => self.deliver(dbr.into()),
            Err(status) => warn!("Bad monitor update for '{}': {status}", self.name),
        }
    }

    fn on_connected<Ch>(self: &Arc<Self>, channel: &Ch)
    where
        Ch: Channel<Monitor = M>,
    {
        let Some(dbr_type) = promote(channel.native_type()) else {
            warn!(
                "Channel '{}' has a native type that cannot be monitored",
                self.name
            );
            self.deliver_disconnect();
            return;
        };
        let count = channel.element_count();
        debug!("Subscribing to '{}' as {count} x {dbr_type}", self.name);

        let target = Arc::downgrade(self);
        let on_update = Arc::new(move |update: Result<Dbr, CaStatus>| {
            if let Some(shared) = target.upgrade() {
                shared.on_update(update);
            }
        });
        let monitor = match channel.add_monitor(dbr_type, count, MonitorMask::default(), on_update)
        {
            Ok(monitor) => monitor,
            Err(status) => {
                warn!("Failed to subscribe to '{}': {status}", self.name);
                return;
            }
        };
        if let Err(status) = channel.flush_io() {
            warn!("Failed to flush subscription to '{}': {status}", self.name);
        }

        let previous = {
            let mut state = self.state.lock();
            if state.closed {
                Some(monitor)
            } else {
                state.monitor.replace(monitor)
            }
        };
        if let Some(stale) = previous {
            release(&self.name, stale);
        }
    }

    fn on_disconnected(&self) {
        let monitor = self.state.lock().monitor.take();
        if let Some(monitor) = monitor {
            debug!("Lost connection to '{}'", self.name);
            release(&self.name, monitor);
            self.deliver_disconnect();
        }
    }
}

fn release<M: MonitorHandle>(name: &str, monitor: M) {
    if let Err(status) = monitor.clear() {
        warn!("Failed to clear subscription for '{name}': {status}");
    }
}

/// A persistent subscription to one PV
pub struct Subscription<Ch: Channel> {
    channel: Arc<Ch>,
    shared: Arc<Shared<Ch::Monitor>>,
    listener: Mutex<Option<ListenerId>>,
}

impl<Ch: Channel> Subscription<Ch> {
    pub(crate) fn new(channel: Arc<Ch>) -> Result<Self> {
        let shared = Arc::new(Shared {
            name: channel.name().to_owned(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                capacity: 1,
                timeout: Some(DEFAULT_WAIT_TIMEOUT),
                last: None,
                listeners: Vec::new(),
                next_key: 0,
                monitor: None,
                closed: false,
            }),
            arrived: Condvar::new(),
        });

        let callback_shared = Arc::downgrade(&shared);
        let target: Weak<Ch> = Arc::downgrade(&channel);
        let listener: ConnectionListener = Arc::new(move |event: ConnectionEvent| {
            let Some(shared) = callback_shared.upgrade() else {
                return;
            };
            if shared.is_closed() {
                return;
            }
            let _span = debug_span!("subscription", pv = shared.name.as_str()).entered();
            match event {
                ConnectionEvent::Connected => {
                    if let Some(channel) = target.upgrade() {
                        shared.on_connected(&*channel);
                    }
                }
                ConnectionEvent::Disconnected => shared.on_disconnected(),
            }
        });

        let id = channel
            .add_connection_listener(listener)
            .map_err(|status| Error::Subscribe {
                name: shared.name.clone(),
                status,
            })?;

        Ok(Subscription {
            channel,
            shared,
            listener: Mutex::new(Some(id)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Set how many envelopes are queued. Values below one are raised to one.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.shared.state.lock();
        state.capacity = capacity.max(1);
        while state.queue.len() > state.capacity {
            state.queue.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity
    }

    /// Set the timeout used by [`Subscription::wait`]. `None` waits forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.shared.state.lock().timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.shared.state.lock().timeout
    }

    /// Take the oldest queued envelope, waiting for one to arrive.
    ///
    /// `None` blocks until an envelope arrives, zero polls without blocking,
    /// and anything else blocks for at most that long. Returns `None` if
    /// nothing arrived in time or the subscription was closed.
    pub fn wait_for(&self, timeout: Option<Duration>) -> Option<Envelope> {
        // A timeout too long to represent waits like `None`
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.shared.state.lock();
        loop {
            if let Some(envelope) = state.queue.pop_front() {
                return Some(envelope);
            }
            if state.closed {
                return None;
            }
            match deadline {
                None => self.shared.arrived.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    if self.shared.arrived.wait_until(&mut state, deadline).timed_out() {
                        return state.queue.pop_front();
                    }
                }
            }
        }
    }

    /// [`Subscription::wait_for`] with the subscription's own timeout
    pub fn wait(&self) -> Option<Envelope> {
        let timeout = self.timeout();
        self.wait_for(timeout)
    }

    /// Take the oldest queued envelope without blocking
    pub fn try_next(&self) -> Option<Envelope> {
        self.wait_for(Some(Duration::ZERO))
    }

    /// Drop every queued envelope
    pub fn clear(&self) {
        self.shared.state.lock().queue.clear();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recently delivered envelope, whether or not it is still queued
    pub fn last(&self) -> Option<Envelope> {
        self.shared.state.lock().last.clone()
    }

    /// Call `listener` with every envelope delivered from now on
    pub fn add_listener<F>(&self, listener: F) -> ListenerKey
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock();
        let key = ListenerKey(state.next_key);
        state.next_key += 1;
        state.listeners.push((key, Arc::new(listener)));
        key
    }

    /// Returns whether the listener was registered
    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        let mut state = self.shared.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(k, _)| *k != key);
        state.listeners.len() != before
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop the subscription. Calling this more than once is harmless.
    pub fn close(&self) {
        let monitor = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.listeners.clear();
            state.monitor.take()
        };
        self.shared.arrived.notify_all();
        debug!("Closing subscription to '{}'", self.shared.name);
        if let Some(id) = self.listener.lock().take() {
            self.channel.remove_connection_listener(id);
        }
        if let Some(monitor) = monitor {
            release(&self.shared.name, monitor);
        }
    }
}

impl<Ch: Channel> Drop for Subscription<Ch> {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!(
                "Subscription to '{}' dropped without being closed",
                self.shared.name
            );
            self.close();
        }
    }
}
