//! Completion status codes reported by the protocol client.

use std::fmt;

/// Status of a completed CA operation, as the `ECA_*` condition codes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CaStatus {
    Normal = 0,
    AllocMem = 6,
    TooLarge = 9,
    Timeout = 10,
    BadType = 14,
    Internal = 17,
    GetFail = 19,
    PutFail = 20,
    BadCount = 22,
    BadStr = 23,
    Disconn = 24,
    BadMonId = 30,
    BadMask = 41,
    IoInProgress = 43,
    NoRdAccess = 46,
    NoWtAccess = 47,
    NoConvert = 50,
    BadChId = 51,
    UnavailInServ = 54,
    ChanDestroy = 55,
}

impl CaStatus {
    pub fn is_successful(&self) -> bool {
        matches!(self, CaStatus::Normal)
    }

    /// The numeric `ECA_*` condition code
    pub fn code(&self) -> u16 {
        *self as u16
    }
}

impl fmt::Display for CaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Normal => "Normal successful completion",
                Self::AllocMem => "Unable to allocate additional dynamic memory",
                Self::TooLarge =>
                    "The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES",
                Self::Timeout => "User specified timeout on IO operation expired",
                Self::BadType => "The data type specified is invalid",
                Self::Internal => "Channel Access Internal Failure",
                Self::GetFail => "Channel read request failed",
                Self::PutFail => "Channel write request failed",
                Self::BadCount => "Invalid element count requested",
                Self::BadStr => "Invalid string",
                Self::Disconn => "Virtual circuit disconnect",
                Self::BadMonId => "Bad event subscription (monitor) identifier",
                Self::BadMask => "Invalid event selection mask",
                Self::IoInProgress => "IO operations are in progress",
                Self::NoRdAccess => "Read access denied",
                Self::NoWtAccess => "Write access denied",
                Self::NoConvert => "No reasonable data conversion between client and server types",
                Self::BadChId => "Invalid channel identifier",
                Self::UnavailInServ => "Not supported by attached service",
                Self::ChanDestroy => "User destroyed channel",
            }
        )
    }
}

impl std::error::Error for CaStatus {}
