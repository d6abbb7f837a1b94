//! Blocking access to PVs through a protocol [`Context`].

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    cache::ChannelCache,
    coerce::{AppValue, coerce_writable},
    config::Config,
    context::Context,
    dbr::{DBR_TIME_LONG, DbrType, DbrValue},
    envelope::{Envelope, Severity},
    error::{Error, Result},
    request::{Deadline, PendingRequest},
    subscription::Subscription,
};

/// A set of channels and a timeout, shared by every operation.
///
/// Operations can be issued from several threads at once. Call
/// [`Session::close`] when done; channels are not released otherwise.
/// Subscriptions created by a session must be closed separately.
pub struct Session<C: Context> {
    cache: ChannelCache<C>,
    timeout: Mutex<Duration>,
}

impl<C: Context> Session<C> {
    pub fn new(context: C) -> Self {
        Self::with_config(context, &Config::default())
    }

    pub fn with_config(context: C, config: &Config) -> Self {
        info!("Opening session over {}", std::any::type_name::<C>());
        Session {
            cache: ChannelCache::new(Arc::new(context)),
            timeout: Mutex::new(config.get_timeout()),
        }
    }

    pub fn context(&self) -> &C {
        self.cache.context()
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    /// Change the timeout for later operations, returning the previous one.
    ///
    /// A timeout too long to be represented as an instant never expires.
    pub fn set_timeout(&self, timeout: Duration) -> Result<Duration> {
        if timeout.is_zero() {
            return Err(Error::InvalidTimeout);
        }
        let mut current = self.timeout.lock();
        let previous = *current;
        *current = timeout;
        Ok(previous)
    }

    /// Read a PV as its native type, including alarm severity and timestamp.
    ///
    /// Fails with [`Error::InvalidAlarm`] if the PV reports an `INVALID`
    /// severity.
    pub fn read(&self, name: &str) -> Result<Envelope> {
        let envelope = self.fetch(name, None, None)?;
        if envelope.severity() == Severity::Invalid {
            return Err(Error::InvalidAlarm(name.to_owned()));
        }
        Ok(envelope)
    }

    /// Read only the value of a PV, with the same alarm check as [`Session::read`]
    pub fn read_value(&self, name: &str) -> Result<DbrValue> {
        self.read(name).map(Envelope::into_value)
    }

    /// Read a PV and convert its elements to `T`
    pub fn read_as<T>(&self, name: &str) -> Result<Vec<T>>
    where
        for<'a> Vec<T>: TryFrom<&'a DbrValue>,
    {
        let value = self.read_value(name)?;
        Vec::<T>::try_from(&value).map_err(|_| Error::NoConvert {
            name: name.to_owned(),
        })
    }

    /// Read a PV as an explicit type and element count.
    ///
    /// `None` requests the native type or full length. No alarm check is
    /// made on the result.
    pub fn fetch(
        &self,
        name: &str,
        dbr_type: Option<DbrType>,
        count: Option<usize>,
    ) -> Result<Envelope> {
        let deadline = Deadline::after(self.timeout());
        let channel = self.cache.lookup(name)?;
        PendingRequest::read(channel, dbr_type, count)?.wait_until(deadline)
    }

    /// Read several PVs against one shared deadline.
    ///
    /// Every read is issued before any is waited on. A PV that has not
    /// answered by the deadline gives `None` in its slot; any other failure
    /// fails the whole call.
    pub fn read_many<I, S>(&self, names: I) -> Result<Vec<Option<Envelope>>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let deadline = Deadline::after(self.timeout());
        let requests = names
            .into_iter()
            .map(|name| {
                let channel = self.cache.lookup(name.as_ref())?;
                PendingRequest::read(channel, None, None)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            match request.wait_until(deadline) {
                Ok(envelope) => results.push(Some(envelope)),
                Err(err) if err.is_timeout() => {
                    debug!("{err}, leaving its slot empty");
                    results.push(None);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(results)
    }

    /// Write a value, converting it to a protocol array first.
    ///
    /// With `wait` this blocks until the server has processed the write.
    pub fn write(&self, name: &str, value: impl Into<AppValue>, wait: bool) -> Result<()> {
        let value = coerce_writable(value.into())?;
        self.write_dbr(name, value, wait)
    }

    fn write_dbr(&self, name: &str, value: DbrValue, wait: bool) -> Result<()> {
        let deadline = Deadline::after(self.timeout());
        let channel = self.cache.lookup(name)?;
        PendingRequest::write(channel, value, wait)?.wait_until(deadline)
    }

    /// Read a 32-bit unsigned value carried in a signed `LONG`
    pub fn read_uint(&self, name: &str) -> Result<u32> {
        let values = self.read_uint_array(name, 1)?;
        values.first().copied().ok_or_else(|| Error::NoConvert {
            name: name.to_owned(),
        })
    }

    /// Read `count` 32-bit unsigned values carried in a signed `LONG` array
    pub fn read_uint_array(&self, name: &str, count: usize) -> Result<Vec<u32>> {
        let envelope = self.fetch(name, Some(DBR_TIME_LONG), Some(count))?;
        match envelope.value() {
            DbrValue::Long(values) => Ok(values.iter().map(|v| *v as u32).collect()),
            _ => Err(Error::NoConvert {
                name: name.to_owned(),
            }),
        }
    }

    /// Write the low 32 bits of `value` as a signed `LONG`.
    ///
    /// Higher bits are discarded, there is no range check.
    pub fn write_uint(&self, name: &str, value: u64, wait: bool) -> Result<()> {
        self.write_dbr(name, DbrValue::Long(vec![value as u32 as i32]), wait)
    }

    /// Start a persistent subscription to a PV
    pub fn monitor(&self, name: &str) -> Result<Subscription<C::Channel>> {
        let channel = self.cache.lookup(name)?;
        Subscription::new(channel)
    }

    /// Start connecting to PVs ahead of their first use. Failures are logged.
    pub fn connect<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            if let Err(err) = self.cache.lookup(name.as_ref()) {
                error!("Failed to connect '{}': {err}", name.as_ref());
            }
        }
    }

    /// Release the channels of some PVs. The session stays usable.
    pub fn disconnect<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.cache.remove(name.as_ref());
        }
    }

    /// Whether a channel to `name` is currently held
    pub fn is_cached(&self, name: &str) -> bool {
        self.cache.contains(name)
    }

    /// Description of the session and its protocol context
    pub fn info(&self) -> String {
        format!(
            "Session: {} cached channels, timeout {:.3} s\n{}",
            self.cache.len(),
            self.timeout().as_secs_f64(),
            self.cache.context().describe()
        )
    }

    pub fn is_closed(&self) -> bool {
        self.cache.is_closed()
    }

    /// Destroy every channel and dispose of the context.
    ///
    /// No further operation is valid; they fail with
    /// [`Error::SessionClosed`]. Closing again does nothing.
    pub fn close(&self) {
        if self.cache.close() {
            info!("Closing session");
            self.cache.context().dispose();
        }
    }
}

impl<C: Context> Drop for Session<C> {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("Session dropped without being closed");
            self.close();
        }
    }
}
