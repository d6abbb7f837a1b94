use std::time::Duration;

use thiserror::Error;

use crate::{coerce::CoercionError, status::CaStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Timed out after {timeout:?} waiting for {name}")]
    Timeout { name: String, timeout: Duration },
    #[error("Lost connection to {0} before the request completed")]
    ConnectionLost(String),
    #[error("Request on {name} failed: {status}")]
    Protocol { name: String, status: CaStatus },
    #[error("Write of {requested} elements exceeds the {max} element capacity of {name}")]
    SizeExceeded {
        name: String,
        requested: usize,
        max: usize,
    },
    #[error("{0}")]
    Coercion(#[from] CoercionError),
    #[error("{0} reported an INVALID alarm severity")]
    InvalidAlarm(String),
    #[error("Could not create a channel to {name}: {status}")]
    ChannelCreate { name: String, status: CaStatus },
    #[error("Could not subscribe to {name}: {status}")]
    Subscribe { name: String, status: CaStatus },
    #[error("Timeout must be greater than zero")]
    InvalidTimeout,
    #[error("The session is closing or has closed")]
    SessionClosed,
    #[error("The value of {name} could not be converted to the requested type")]
    NoConvert { name: String },
}

impl Error {
    /// The name of the PV this error concerns, if any
    pub fn pv_name(&self) -> Option<&str> {
        match self {
            Error::Timeout { name, .. }
            | Error::Protocol { name, .. }
            | Error::SizeExceeded { name, .. }
            | Error::ChannelCreate { name, .. }
            | Error::Subscribe { name, .. }
            | Error::NoConvert { name } => Some(name),
            Error::ConnectionLost(name) | Error::InvalidAlarm(name) => Some(name),
            Error::Coercion(_) | Error::InvalidTimeout | Error::SessionClosed => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
