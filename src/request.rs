//! One-shot blocking requests over a callback-driven channel.
//!
//! A [`PendingRequest`] registers a connection listener on a channel and,
//! the first time the channel reports it is connected, runs an action that
//! issues the actual protocol operation. The action is handed a [`Completer`]
//! that the protocol callback uses to deliver the outcome. The caller blocks
//! in [`PendingRequest::wait_until`] for that outcome or a [`Deadline`],
//! whichever comes first.
//!
//! Once a request has completed (including by timing out) every further
//! callback for it is ignored.

use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::{
    context::{Channel, ConnectionEvent, ConnectionListener, ListenerId},
    dbr::{DBR_TIME_STRING, Dbr, DbrCategory, DbrType, DbrValue, promote},
    envelope::Envelope,
    error::{Error, Result},
    status::CaStatus,
};

/// The point at which a blocking call gives up, and the timeout it came from.
///
/// A timeout too long to be represented as an [`Instant`] never expires.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
    timeout: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Deadline {
            at: Instant::now().checked_add(timeout),
            timeout,
        }
    }

    /// `None` if the deadline never expires
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the channel to connect
    Armed,
    /// The operation has been issued, waiting for its completion
    Connected,
    Completed,
}

struct RequestState<T> {
    phase: Phase,
    outcome: Option<Result<T>>,
}

struct RequestShared<T> {
    name: String,
    state: Mutex<RequestState<T>>,
    done: Condvar,
}

impl<T> RequestShared<T> {
    /// Record the outcome, unless one was recorded already
    fn complete(&self, outcome: Result<T>) -> bool {
        let mut state = self.state.lock();
        if state.phase == Phase::Completed {
            trace!("Ignoring late completion for '{}'", self.name);
            return false;
        }
        state.phase = Phase::Completed;
        state.outcome = Some(outcome);
        self.done.notify_all();
        true
    }
}

/// Handle used by protocol callbacks to finish a request
pub struct Completer<T> {
    shared: Arc<RequestShared<T>>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Completer {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Completer<T> {
    /// Deliver the outcome. Returns `false` if the request had already
    /// completed, in which case the outcome is dropped.
    pub fn complete(&self, outcome: Result<T>) -> bool {
        self.shared.complete(outcome)
    }

    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().phase == Phase::Completed
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

/// A single in-flight operation on one channel
pub struct PendingRequest<Ch: Channel, T> {
    channel: Arc<Ch>,
    shared: Arc<RequestShared<T>>,
    listener: Option<ListenerId>,
}

impl<Ch: Channel, T: Send + 'static> PendingRequest<Ch, T> {
    /// Arm a request that runs `on_connected` once the channel is connected.
    ///
    /// If `on_connected` returns an error the request completes with it. A
    /// disconnection before completion completes the request with
    /// [`Error::ConnectionLost`].
    pub fn new<F>(channel: Arc<Ch>, on_connected: F) -> Result<Self>
    where
        F: FnOnce(&Ch, Completer<T>) -> Result<()> + Send + 'static,
    {
        let name = channel.name().to_owned();
        let shared = Arc::new(RequestShared {
            name: name.clone(),
            state: Mutex::new(RequestState {
                phase: Phase::Armed,
                outcome: None,
            }),
            done: Condvar::new(),
        });

        let action = Mutex::new(Some(on_connected));
        let target: Weak<Ch> = Arc::downgrade(&channel);
        let listener_shared = shared.clone();
        let listener: ConnectionListener = Arc::new(move |event: ConnectionEvent| match event {
            ConnectionEvent::Connected => {
                {
                    let mut state = listener_shared.state.lock();
                    if state.phase != Phase::Armed {
                        return;
                    }
                    state.phase = Phase::Connected;
                }
                let Some(action) = action.lock().take() else {
                    return;
                };
                let Some(channel) = target.upgrade() else {
                    listener_shared.complete(Err(Error::ConnectionLost(listener_shared.name.clone())));
                    return;
                };
                trace!("'{}' connected, issuing request", listener_shared.name);
                let completer = Completer {
                    shared: listener_shared.clone(),
                };
                if let Err(err) = action(&channel, completer) {
                    listener_shared.complete(Err(err));
                }
            }
            ConnectionEvent::Disconnected => {
                if listener_shared.complete(Err(Error::ConnectionLost(listener_shared.name.clone())))
                {
                    debug!("'{}' disconnected with a request in flight", listener_shared.name);
                }
            }
        });

        let id = channel
            .add_connection_listener(listener)
            .map_err(|status| protocol_error(&name, status))?;

        Ok(PendingRequest {
            channel,
            shared,
            listener: Some(id),
        })
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    /// Block until the request completes or `deadline` passes.
    ///
    /// A request still incomplete at the deadline is marked completed with
    /// [`Error::Timeout`], so a late result is discarded.
    pub fn wait_until(self, deadline: Deadline) -> Result<T> {
        let mut state = self.shared.state.lock();
        while state.phase != Phase::Completed {
            let Some(at) = deadline.instant() else {
                self.shared.done.wait(&mut state);
                continue;
            };
            if self.shared.done.wait_until(&mut state, at).timed_out()
                && state.phase != Phase::Completed
            {
                debug!("Request for '{}' timed out", self.shared.name);
                state.phase = Phase::Completed;
                state.outcome = Some(Err(Error::Timeout {
                    name: self.shared.name.clone(),
                    timeout: deadline.timeout(),
                }));
            }
        }
        state.outcome.take().unwrap_or_else(|| {
            Err(Error::Protocol {
                name: self.shared.name.clone(),
                status: CaStatus::Internal,
            })
        })
    }

    /// Block for at most `timeout`
    pub fn wait(self, timeout: Duration) -> Result<T> {
        self.wait_until(Deadline::after(timeout))
    }
}

impl<Ch: Channel> PendingRequest<Ch, Envelope> {
    /// Read the channel once.
    ///
    /// `None` for the type requests the native type promoted to its `Time`
    /// variant; `None` for the count requests the channel's full length.
    pub fn read(
        channel: Arc<Ch>,
        dbr_type: Option<DbrType>,
        count: Option<usize>,
    ) -> Result<Self> {
        Self::new(channel, move |channel, completer| {
            let dbr_type = dbr_type
                .unwrap_or_else(|| promote(channel.native_type()).unwrap_or(DBR_TIME_STRING));
            let count = count.unwrap_or_else(|| channel.element_count());
            debug!("Reading {count} x {dbr_type} from '{}'", channel.name());
            let name = channel.name().to_owned();
            channel
                .get(
                    dbr_type,
                    count,
                    Box::new(move |result: std::result::Result<Dbr, CaStatus>| {
                        if let Ok(dbr) = &result {
                            trace!("'{name}' answered with {}", dbr.data_type());
                        }
                        completer.complete(
                            result
                                .map(Envelope::from)
                                .map_err(|status| protocol_error(&name, status)),
                        );
                    }),
                )
                .map_err(|status| protocol_error(channel.name(), status))?;
            channel
                .flush_io()
                .map_err(|status| protocol_error(channel.name(), status))
        })
    }
}

impl<Ch: Channel> PendingRequest<Ch, ()> {
    /// Write a value to the channel.
    ///
    /// With `wait` the request completes when the server acknowledges the
    /// write, otherwise as soon as it has been flushed. A value longer than
    /// the channel fails with [`Error::SizeExceeded`] without being sent.
    pub fn write(channel: Arc<Ch>, value: DbrValue, wait: bool) -> Result<Self> {
        Self::new(channel, move |channel, completer| {
            let count = value.get_count();
            let max = channel.element_count();
            if count > max {
                return Err(Error::SizeExceeded {
                    name: channel.name().to_owned(),
                    requested: count,
                    max,
                });
            }
            let dbr_type = DbrType::new(value.get_type(), DbrCategory::Basic);
            debug!(
                "Writing {count} x {dbr_type} to '{}'{}",
                channel.name(),
                if wait { " with callback" } else { "" }
            );
            let on_complete = wait.then(|| {
                let completer = completer.clone();
                let name = channel.name().to_owned();
                Box::new(move |status: CaStatus| {
                    completer.complete(if status.is_successful() {
                        Ok(())
                    } else {
                        Err(protocol_error(&name, status))
                    });
                }) as Box<dyn FnOnce(CaStatus) + Send>
            });
            channel
                .put(dbr_type, count, value, on_complete)
                .map_err(|status| protocol_error(channel.name(), status))?;
            channel
                .flush_io()
                .map_err(|status| protocol_error(channel.name(), status))?;
            if !wait {
                completer.complete(Ok(()));
            }
            Ok(())
        })
    }
}

impl<Ch: Channel, T> Drop for PendingRequest<Ch, T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.phase = Phase::Completed;
        }
        if let Some(id) = self.listener.take() {
            self.channel.remove_connection_listener(id);
        }
    }
}

/// Map a protocol status onto the error a caller sees
pub(crate) fn protocol_error(name: &str, status: CaStatus) -> Error {
    match status {
        CaStatus::Disconn => Error::ConnectionLost(name.to_owned()),
        status => Error::Protocol {
            name: name.to_owned(),
            status,
        },
    }
}
