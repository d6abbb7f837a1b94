//! An in-process protocol backend.
//!
//! [`LoopbackContext`] serves PVs registered with [`LoopbackContext::add_pv`]
//! to channels created from the same context, without any network traffic.
//! It behaves the way a remote client library does towards a session: every
//! connection change, read result, write acknowledgement and monitor update
//! is delivered through callbacks on a separate dispatch thread, in the
//! order they were issued.
//!
//! The [`PvHandle`] returned for each PV lets a test or an embedding
//! application play the server side: change values and severities, drop and
//! restore connections, or refuse writes.
//!
//! ```
//! use cashell::{Session, loopback::LoopbackContext};
//!
//! let context = LoopbackContext::new().unwrap();
//! let pv = context.add_pv("COUNTER", 41i32).unwrap();
//! let session = Session::new(context);
//! session.write("COUNTER", 42i32, true).unwrap();
//! assert_eq!(pv.load(), 42i32.into());
//! assert_eq!(session.read_as::<i32>("COUNTER").unwrap(), vec![42]);
//! session.close();
//! ```

mod dispatch;
mod pv;

use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, debug_span, info, trace};

use self::{
    dispatch::{Dispatcher, Job},
    pv::{MonitorEntry, Pv},
};
pub use self::pv::PvHandle;
use crate::{
    config::Config,
    context::{
        Channel, ConnectionEvent, ConnectionListener, Context, GetCallback, ListenerId,
        MonitorCallback, MonitorHandle, MonitorMask, PutCallback,
    },
    dbr::{Dbr, DbrBasicType, DbrType, DbrValue},
    status::CaStatus,
};

#[derive(Debug)]
pub struct PvAlreadyExists;

impl fmt::Display for PvAlreadyExists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A PV with this name already exists")
    }
}

impl std::error::Error for PvAlreadyExists {}

/// Counts of the protocol operations a context has carried out
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub channels_created: usize,
    pub channels_destroyed: usize,
    pub gets: usize,
    pub puts: usize,
    pub monitors_added: usize,
    pub monitors_cleared: usize,
}

impl LoopbackStats {
    /// Channels created and not yet destroyed
    pub fn channels_open(&self) -> usize {
        self.channels_created.saturating_sub(self.channels_destroyed)
    }
}

#[derive(Default)]
struct Counters {
    channels_created: AtomicUsize,
    channels_destroyed: AtomicUsize,
    gets: AtomicUsize,
    puts: AtomicUsize,
    monitors_added: AtomicUsize,
    monitors_cleared: AtomicUsize,
}

#[derive(Default)]
struct Registry {
    pvs: HashMap<String, Arc<Mutex<Pv>>>,
    /// Channels created for names that have no PV yet
    waiting: HashMap<String, Vec<Weak<LoopbackChannel>>>,
}

/// Everything shared between a context, its channels and its PV handles
pub(crate) struct Core {
    config: Config,
    dispatcher: Dispatcher,
    registry: Mutex<Registry>,
    counters: Counters,
    next_id: AtomicU64,
}

impl Core {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(&self, job: Job) {
        if !self.dispatcher.submit(job) {
            debug!("Loopback context disposed, dropping callback");
        }
    }

    /// Queue monitor updates, each as its own callback
    pub(crate) fn post(&self, updates: Vec<(MonitorCallback, Result<Dbr, CaStatus>)>) {
        for (callback, update) in updates {
            self.submit(Box::new(move || callback(update)));
        }
    }

    /// Element limit imposed by the array size configuration
    fn element_limit(&self, basic_type: DbrBasicType) -> usize {
        self.config.get_max_array_bytes() / basic_type.element_size().max(1)
    }
}

/// A [`Context`] serving PVs from within the process
#[derive(Clone)]
pub struct LoopbackContext {
    core: Arc<Core>,
}

impl LoopbackContext {
    pub fn new() -> io::Result<Self> {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> io::Result<Self> {
        Self::build(config.clone(), Duration::ZERO)
    }

    /// A context whose callbacks are each delayed by `latency`
    pub fn with_latency(latency: Duration) -> io::Result<Self> {
        Self::build(Config::default(), latency)
    }

    fn build(config: Config, latency: Duration) -> io::Result<Self> {
        Ok(LoopbackContext {
            core: Arc::new(Core {
                config,
                dispatcher: Dispatcher::start(latency)?,
                registry: Default::default(),
                counters: Default::default(),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Serve a new PV. Its native type and length come from `initial`.
    pub fn add_pv(
        &self,
        name: &str,
        initial: impl Into<DbrValue>,
    ) -> Result<PvHandle, PvAlreadyExists> {
        self.add_pv_with_capacity(name, initial, 0)
    }

    /// Serve a new PV that can hold up to `capacity` elements
    pub fn add_pv_with_capacity(
        &self,
        name: &str,
        initial: impl Into<DbrValue>,
        capacity: usize,
    ) -> Result<PvHandle, PvAlreadyExists> {
        let pv = Arc::new(Mutex::new(Pv::new(name, initial.into(), capacity)));
        let waiting = {
            let mut registry = self.core.registry.lock();
            if registry.pvs.contains_key(name) {
                return Err(PvAlreadyExists);
            }
            registry.pvs.insert(name.to_owned(), pv.clone());
            registry.waiting.remove(name).unwrap_or_default()
        };
        debug!("Added PV '{name}'");
        for channel in waiting.iter().filter_map(Weak::upgrade) {
            channel.attach(&pv);
        }
        Ok(PvHandle {
            pv,
            core: self.core.clone(),
        })
    }

    /// Handle to a PV added earlier
    pub fn pv(&self, name: &str) -> Option<PvHandle> {
        let pv = self.core.registry.lock().pvs.get(name).cloned()?;
        Some(PvHandle {
            pv,
            core: self.core.clone(),
        })
    }

    pub fn pv_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.core.registry.lock().pvs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn stats(&self) -> LoopbackStats {
        let c = &self.core.counters;
        // Destroyed first, so it never runs ahead of created
        let channels_destroyed = c.channels_destroyed.load(Ordering::SeqCst);
        LoopbackStats {
            channels_created: c.channels_created.load(Ordering::SeqCst),
            channels_destroyed,
            gets: c.gets.load(Ordering::SeqCst),
            puts: c.puts.load(Ordering::SeqCst),
            monitors_added: c.monitors_added.load(Ordering::SeqCst),
            monitors_cleared: c.monitors_cleared.load(Ordering::SeqCst),
        }
    }

    pub fn is_disposed(&self) -> bool {
        !self.core.dispatcher.is_running()
    }
}

impl Context for LoopbackContext {
    type Channel = LoopbackChannel;

    fn create_channel(&self, name: &str) -> Result<Arc<LoopbackChannel>, CaStatus> {
        if name.is_empty() {
            return Err(CaStatus::BadStr);
        }
        if !self.core.dispatcher.is_running() {
            return Err(CaStatus::ChanDestroy);
        }
        let channel = Arc::new(LoopbackChannel {
            id: self.core.next_id(),
            name: name.to_owned(),
            core: self.core.clone(),
            state: Mutex::new(ChannelState::default()),
        });
        self.core
            .counters
            .channels_created
            .fetch_add(1, Ordering::SeqCst);

        let pv = {
            let mut registry = self.core.registry.lock();
            match registry.pvs.get(name) {
                Some(pv) => Some(pv.clone()),
                None => {
                    registry
                        .waiting
                        .entry(name.to_owned())
                        .or_default()
                        .push(Arc::downgrade(&channel));
                    None
                }
            }
        };
        match pv {
            Some(pv) => channel.attach(&pv),
            None => trace!("No PV '{name}' yet, channel waits for it"),
        }
        Ok(channel)
    }

    fn flush_io(&self) -> Result<(), CaStatus> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "Loopback context serving {} PVs\n{}",
            self.core.registry.lock().pvs.len(),
            self.core.config
        )
    }

    fn dispose(&self) {
        info!("Disposing loopback context");
        self.core.dispatcher.stop();
    }
}

#[derive(Default)]
struct ChannelState {
    pv: Option<Arc<Mutex<Pv>>>,
    connected: bool,
    destroyed: bool,
    listeners: Vec<(ListenerId, ConnectionListener)>,
    next_listener: u64,
}

/// A channel created by a [`LoopbackContext`]
pub struct LoopbackChannel {
    id: u64,
    name: String,
    core: Arc<Core>,
    state: Mutex<ChannelState>,
}

impl LoopbackChannel {
    fn attach(self: &Arc<Self>, pv: &Arc<Mutex<Pv>>) {
        let connected = {
            let mut record = pv.lock();
            record.channels.push((self.id, Arc::downgrade(self)));
            record.connected
        };
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.pv = Some(pv.clone());
        }
        self.set_connected(connected);
    }

    /// Record a connection change and notify the listeners
    fn set_connected(&self, connected: bool) {
        let mut state = self.state.lock();
        if state.destroyed || state.connected == connected {
            return;
        }
        state.connected = connected;
        let event = if connected {
            ConnectionEvent::Connected
        } else {
            ConnectionEvent::Disconnected
        };
        debug!("Channel '{}' {:?}", self.name, event);
        for (_, listener) in &state.listeners {
            self.notify(listener.clone(), event);
        }
    }

    fn notify(&self, listener: ConnectionListener, event: ConnectionEvent) {
        let id = self.id;
        self.core.submit(Box::new(move || {
            let _span = debug_span!("connection", cid = id).entered();
            listener(event)
        }));
    }

    /// The PV of a connected channel
    fn connected_pv(&self) -> Result<Arc<Mutex<Pv>>, CaStatus> {
        let state = self.state.lock();
        if state.destroyed {
            return Err(CaStatus::BadChId);
        }
        match (&state.pv, state.connected) {
            (Some(pv), true) => Ok(pv.clone()),
            _ => Err(CaStatus::Disconn),
        }
    }
}

impl Channel for LoopbackChannel {
    type Monitor = LoopbackMonitor;

    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn native_type(&self) -> Option<DbrBasicType> {
        let pv = self.state.lock().pv.clone()?;
        pv.lock().native_type
    }

    fn element_count(&self) -> usize {
        let Some(pv) = self.state.lock().pv.clone() else {
            return 0;
        };
        let pv = pv.lock();
        pv.max_count
            .min(self.core.element_limit(pv.value.get_type()))
    }

    fn add_connection_listener(
        &self,
        listener: ConnectionListener,
    ) -> Result<ListenerId, CaStatus> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(CaStatus::BadChId);
        }
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push((id, listener.clone()));
        if state.connected {
            self.notify(listener, ConnectionEvent::Connected);
        }
        Ok(id)
    }

    fn remove_connection_listener(&self, id: ListenerId) {
        self.state.lock().listeners.retain(|(i, _)| *i != id);
    }

    fn get(&self, dbr_type: DbrType, count: usize, on_complete: GetCallback) -> Result<(), CaStatus> {
        let pv = self.connected_pv()?;
        if count > self.element_count() {
            return Err(CaStatus::BadCount);
        }
        self.core.counters.gets.fetch_add(1, Ordering::SeqCst);
        let id = self.id;
        self.core.submit(Box::new(move || {
            let _span = debug_span!("get", cid = id).entered();
            let result = {
                let pv = pv.lock();
                if pv.connected {
                    pv.snapshot(dbr_type, count)
                } else {
                    Err(CaStatus::Disconn)
                }
            };
            on_complete(result);
        }));
        Ok(())
    }

    fn put(
        &self,
        dbr_type: DbrType,
        count: usize,
        value: DbrValue,
        on_complete: Option<PutCallback>,
    ) -> Result<(), CaStatus> {
        let pv = self.connected_pv()?;
        if count > self.element_count() {
            return Err(CaStatus::BadCount);
        }
        if value.get_type() != dbr_type.basic_type {
            return Err(CaStatus::BadType);
        }
        self.core.counters.puts.fetch_add(1, Ordering::SeqCst);
        let id = self.id;
        let core = self.core.clone();
        self.core.submit(Box::new(move || {
            let _span = debug_span!("put", cid = id).entered();
            let (status, updates) = {
                let mut pv = pv.lock();
                let outcome = match pv.reject_puts {
                    Some(status) => Err(status),
                    None if !pv.connected => Err(CaStatus::Disconn),
                    None => pv.update_from_client(&value),
                };
                match outcome {
                    Ok(()) => (CaStatus::Normal, pv.pending_updates()),
                    Err(status) => (status, Vec::new()),
                }
            };
            if !status.is_successful() {
                debug!("Put failed: {status}");
            }
            core.post(updates);
            if let Some(on_complete) = on_complete {
                on_complete(status);
            }
        }));
        Ok(())
    }

    fn add_monitor(
        &self,
        dbr_type: DbrType,
        count: usize,
        mask: MonitorMask,
        on_update: MonitorCallback,
    ) -> Result<LoopbackMonitor, CaStatus> {
        let pv = self.connected_pv()?;
        if !(mask.value || mask.alarm || mask.log || mask.property) {
            return Err(CaStatus::BadMask);
        }
        let monitor_id = self.core.next_id();
        let initial = {
            let mut record = pv.lock();
            let initial = record.snapshot(dbr_type, count);
            record.monitors.insert(
                monitor_id,
                MonitorEntry {
                    channel_id: self.id,
                    dbr_type,
                    count,
                    callback: on_update.clone(),
                },
            );
            initial
        };
        self.core
            .counters
            .monitors_added
            .fetch_add(1, Ordering::SeqCst);
        debug!("Monitor {monitor_id} on '{}' for {mask}", self.name);
        // Subscribers always start with the current value
        self.core.post(vec![(on_update, initial)]);
        Ok(LoopbackMonitor {
            id: monitor_id,
            pv: Arc::downgrade(&pv),
            core: self.core.clone(),
        })
    }

    fn flush_io(&self) -> Result<(), CaStatus> {
        Ok(())
    }

    fn destroy(&self) -> Result<(), CaStatus> {
        let pv = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(CaStatus::BadChId);
            }
            state.destroyed = true;
            state.connected = false;
            state.listeners.clear();
            state.pv.take()
        };
        if let Some(pv) = pv {
            let mut record = pv.lock();
            record.monitors.retain(|_, m| m.channel_id != self.id);
            record.channels.retain(|(id, _)| *id != self.id);
        }
        self.core
            .counters
            .channels_destroyed
            .fetch_add(1, Ordering::SeqCst);
        debug!("Destroyed channel '{}'", self.name);
        Ok(())
    }
}

/// A monitor installed by a [`LoopbackChannel`]
pub struct LoopbackMonitor {
    id: u64,
    pv: Weak<Mutex<Pv>>,
    core: Arc<Core>,
}

impl MonitorHandle for LoopbackMonitor {
    fn clear(&self) -> Result<(), CaStatus> {
        let pv = self.pv.upgrade().ok_or(CaStatus::BadMonId)?;
        if pv.lock().monitors.remove(&self.id).is_none() {
            return Err(CaStatus::BadMonId);
        }
        self.core
            .counters
            .monitors_cleared
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
