// #![warn(missing_docs)]

//! Blocking, timeout-bounded access to EPICS Channel Access process variables.
//!
//! CA client libraries are callback driven: connection changes, read results,
//! write acknowledgements and monitor updates all arrive on the library's own
//! dispatch thread(s). This crate adapts that model to plain blocking calls
//! that each finish within a timeout, so that scripts and interactive tools
//! can say "read this PV" without managing callbacks themselves.
//!
//! The crate is organised as:
//!
//! - The capability surface expected of a protocol client, as the traits in
//!   [`context`]. Any CA implementation can sit behind a [`Session`] by
//!   implementing [`Context`] and [`Channel`].
//! - Representing data transferred over CA (["DBR" types]) in module [dbr],
//!   and the snapshots handed to callers as [`Envelope`].
//! - A [`Session`], which caches one channel per PV name and offers single and
//!   batched reads, writes, and [`Subscription`]s.
//! - [`loopback`], an in-process [`Context`] that serves PVs from the same
//!   program. It is used by the tests and is handy for simulations.
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use cashell::{Session, loopback::LoopbackContext};
//!
//! let context = LoopbackContext::new().unwrap();
//! let temperature = context.add_pv("TEMPERATURE", 21.5f64).unwrap();
//! context.add_pv("SETPOINT", 20.0f64).unwrap();
//!
//! let session = Session::new(context);
//! session.set_timeout(Duration::from_millis(500)).unwrap();
//!
//! let reading = session.read("TEMPERATURE").unwrap();
//! println!("{reading}");
//! session.write("SETPOINT", 22.0f64, true).unwrap();
//!
//! let monitor = session.monitor("TEMPERATURE").unwrap();
//! let initial = monitor.wait().unwrap();
//! temperature.store(22.1f64).unwrap();
//! let next = monitor.wait().unwrap();
//! assert!(next.timestamp() >= initial.timestamp());
//!
//! monitor.close();
//! session.close();
//! ```
//!
//! ## Timeouts
//!
//! Every blocking call on a [`Session`] waits at most [`Session::timeout`]
//! (2 seconds unless configured). A PV that does not connect or answer in time
//! gives [`Error::Timeout`]; [`Session::read_many`] instead leaves that PV's
//! slot empty. A request that timed out may still be answered later by the
//! server, the answer is discarded.
//!
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

mod cache;
pub mod coerce;
pub mod config;
pub mod context;
pub mod dbr;
pub mod envelope;
mod error;
pub mod loopback;
pub mod request;
mod session;
pub mod status;
mod subscription;

pub use crate::cache::ChannelCache;
pub use crate::coerce::{AppValue, CoercionError};
pub use crate::config::Config;
pub use crate::context::{Channel, Context, MonitorHandle};
pub use crate::envelope::{Envelope, Severity};
pub use crate::error::{Error, Result};
pub use crate::session::Session;
pub use crate::status::CaStatus;
pub use crate::subscription::{DEFAULT_WAIT_TIMEOUT, ListenerKey, Subscription};
