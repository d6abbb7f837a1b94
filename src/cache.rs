//! Per-session cache of channels, keyed by PV name.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    context::{Channel, Context},
    error::{Error, Result},
};

struct CacheState<Ch> {
    channels: HashMap<String, Arc<Ch>>,
    closed: bool,
}

/// Owns every channel a session creates. There is at most one channel per
/// name, even when several threads look up a new name at the same time.
pub struct ChannelCache<C: Context> {
    context: Arc<C>,
    state: Mutex<CacheState<C::Channel>>,
}

impl<C: Context> ChannelCache<C> {
    pub fn new(context: Arc<C>) -> Self {
        ChannelCache {
            context,
            state: Mutex::new(CacheState {
                channels: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    /// Get the channel for a name, creating it on first use.
    ///
    /// Creation happens outside of the cache lock. If another caller installs
    /// a channel for the same name in the meantime, ours is destroyed and
    /// theirs is returned.
    pub fn lookup(&self, name: &str) -> Result<Arc<C::Channel>> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::SessionClosed);
            }
            if let Some(channel) = state.channels.get(name) {
                return Ok(channel.clone());
            }
        }

        let candidate =
            self.context
                .create_channel(name)
                .map_err(|status| Error::ChannelCreate {
                    name: name.to_owned(),
                    status,
                })?;

        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            discard(&*candidate);
            return Err(Error::SessionClosed);
        }
        if let Some(winner) = state.channels.get(name).cloned() {
            drop(state);
            debug!("Lost race to create channel '{name}', discarding duplicate");
            discard(&*candidate);
            return Ok(winner);
        }
        state.channels.insert(name.to_owned(), candidate.clone());
        info!("Created channel '{name}'");
        Ok(candidate)
    }

    /// Remove and destroy a single channel. Returns whether it was cached.
    pub fn remove(&self, name: &str) -> bool {
        let Some(channel) = self.state.lock().channels.remove(name) else {
            return false;
        };
        debug!("Disconnecting channel '{name}'");
        if let Err(status) = channel.destroy() {
            error!("Failed to destroy channel '{name}': {status}");
        }
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().channels.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Destroy every cached channel and refuse further lookups.
    ///
    /// Failures are logged and teardown carries on. Returns `false` if the
    /// cache was already closed.
    pub fn close(&self) -> bool {
        let channels: Vec<_> = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.channels.drain().collect()
        };
        debug!("Destroying {} cached channels", channels.len());
        for (name, channel) in channels {
            if let Err(status) = channel.destroy() {
                error!("Failed to destroy channel '{name}': {status}");
            }
        }
        true
    }
}

fn discard<Ch: Channel>(channel: &Ch) {
    if let Err(status) = channel.destroy() {
        warn!(
            "Failed to destroy discarded channel '{}': {status}",
            channel.name()
        );
    }
}
