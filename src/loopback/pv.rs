use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::SystemTime,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Core, LoopbackChannel};
use crate::{
    context::MonitorCallback,
    dbr::{Dbr, DbrBasicType, DbrType, DbrValue, Status},
    envelope::Severity,
    status::CaStatus,
};

pub(crate) struct MonitorEntry {
    pub channel_id: u64,
    pub dbr_type: DbrType,
    pub count: usize,
    pub callback: MonitorCallback,
}

/// A record held by the loopback context
pub(crate) struct Pv {
    pub name: String,
    pub value: DbrValue,
    /// Reported to channels. `None` simulates a type the client cannot map.
    pub native_type: Option<DbrBasicType>,
    pub max_count: usize,
    pub status: Status,
    pub timestamp: SystemTime,
    pub connected: bool,
    pub reject_puts: Option<CaStatus>,
    pub monitors: HashMap<u64, MonitorEntry>,
    pub channels: Vec<(u64, Weak<LoopbackChannel>)>,
}

impl Pv {
    pub fn new(name: &str, value: DbrValue, max_count: usize) -> Self {
        Pv {
            name: name.to_owned(),
            native_type: Some(value.get_type()),
            max_count: max_count.max(value.get_count()).max(1),
            value,
            status: Status::default(),
            timestamp: SystemTime::now(),
            connected: true,
            reject_puts: None,
            monitors: HashMap::new(),
            channels: Vec::new(),
        }
    }

    /// Build a DBR of `count` elements of the current value
    pub fn snapshot(&self, dbr_type: DbrType, count: usize) -> Result<Dbr, CaStatus> {
        let mut value = self.value.clone();
        if count > 0 {
            value.truncate(count);
        }
        Dbr::assemble(dbr_type, &value, self.status, self.timestamp)
    }

    /// Replace the value, converted to the stored type
    pub fn update(&mut self, value: &DbrValue, timestamp: SystemTime) -> Result<(), CaStatus> {
        let value = value.convert_to(self.value.get_type())?;
        if value.get_count() > self.max_count {
            return Err(CaStatus::TooLarge);
        }
        self.value = value;
        self.timestamp = timestamp;
        Ok(())
    }

    /// Store a value written by a client. Strings are parsed into the stored type.
    pub fn update_from_client(&mut self, value: &DbrValue) -> Result<(), CaStatus> {
        let native = self.value.get_type();
        let value = if value.get_type() == DbrBasicType::String && native != DbrBasicType::String
        {
            value
                .parse_into(native)
                .map_err(|_| CaStatus::NoConvert)?
        } else {
            value.clone()
        };
        self.update(&value, SystemTime::now())
    }

    /// The current value for every installed monitor, ready to deliver
    pub fn pending_updates(&self) -> Vec<(MonitorCallback, Result<Dbr, CaStatus>)> {
        if !self.connected {
            return Vec::new();
        }
        self.monitors
            .values()
            .map(|m| (m.callback.clone(), self.snapshot(m.dbr_type, m.count)))
            .collect()
    }

    pub fn live_channels(&self) -> Vec<Arc<LoopbackChannel>> {
        self.channels.iter().filter_map(|(_, c)| c.upgrade()).collect()
    }
}

/// Access to a PV served by a [`super::LoopbackContext`], to change it the way
/// a server would
#[derive(Clone)]
pub struct PvHandle {
    pub(crate) pv: Arc<Mutex<Pv>>,
    pub(crate) core: Arc<Core>,
}

impl PvHandle {
    pub fn name(&self) -> String {
        self.pv.lock().name.clone()
    }

    pub fn load(&self) -> DbrValue {
        self.pv.lock().value.clone()
    }

    pub fn timestamp(&self) -> SystemTime {
        self.pv.lock().timestamp
    }

    pub fn severity(&self) -> Severity {
        Severity::from_raw(self.pv.lock().status.severity)
    }

    /// Set a new value, stamped now, and notify monitors
    pub fn store(&self, value: impl Into<DbrValue>) -> Result<(), CaStatus> {
        self.store_at(value, SystemTime::now())
    }

    /// Set a new value with an explicit timestamp, and notify monitors
    pub fn store_at(&self, value: impl Into<DbrValue>, timestamp: SystemTime) -> Result<(), CaStatus> {
        let updates = {
            let mut pv = self.pv.lock();
            pv.update(&value.into(), timestamp)?;
            pv.pending_updates()
        };
        self.core.post(updates);
        Ok(())
    }

    /// Change the alarm severity, and notify monitors
    pub fn set_severity(&self, severity: Severity) {
        let updates = {
            let mut pv = self.pv.lock();
            pv.status.severity = severity.ordinal() as i16;
            pv.status.status = if severity == Severity::NoAlarm { 0 } else { 1 };
            pv.timestamp = SystemTime::now();
            pv.pending_updates()
        };
        self.core.post(updates);
    }

    /// Drop every channel's connection to this PV
    pub fn disconnect(&self) {
        self.set_connected(false);
    }

    pub fn reconnect(&self) {
        self.set_connected(true);
    }

    fn set_connected(&self, connected: bool) {
        let channels = {
            let mut pv = self.pv.lock();
            if pv.connected == connected {
                return;
            }
            debug!(
                "{} PV '{}'",
                if connected { "Reconnecting" } else { "Disconnecting" },
                pv.name
            );
            pv.connected = connected;
            pv.live_channels()
        };
        for channel in channels {
            channel.set_connected(connected);
        }
    }

    /// Fail every client write with `status`, or accept them again with `None`
    pub fn reject_puts(&self, status: Option<CaStatus>) {
        if status.is_some_and(|s| s.is_successful()) {
            warn!("Rejecting puts with a successful status has no effect");
        }
        self.pv.lock().reject_puts = status;
    }

    /// Report a native type that clients cannot map
    pub fn set_native_type_unknown(&self) {
        self.pv.lock().native_type = None;
    }

    /// Number of monitors installed on this PV
    pub fn monitor_count(&self) -> usize {
        self.pv.lock().monitors.len()
    }

    pub fn is_connected(&self) -> bool {
        self.pv.lock().connected
    }
}
