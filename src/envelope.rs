//! Snapshots of a PV value, its alarm severity and timestamp.
//!
//! An [`Envelope`] is what one-shot reads return and what subscriptions
//! deliver. It is immutable once built.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Local};

use crate::dbr::{Dbr, DbrValue};

/// Alarm severity of a record, from best to worst
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    #[default]
    NoAlarm = 0,
    Minor = 1,
    Major = 2,
    Invalid = 3,
}

impl Severity {
    /// Interpret a raw severity field. Anything out of range counts as invalid.
    pub fn from_raw(raw: i16) -> Self {
        match raw {
            0 => Severity::NoAlarm,
            1 => Severity::Minor,
            2 => Severity::Major,
            _ => Severity::Invalid,
        }
    }

    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Severity::NoAlarm => "NO_ALARM",
            Severity::Minor => "MINOR_ALARM",
            Severity::Major => "MAJOR_ALARM",
            Severity::Invalid => "INVALID_ALARM",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable (value, severity, timestamp) record
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    value: DbrValue,
    severity: Severity,
    timestamp: SystemTime,
}

impl Envelope {
    pub fn new(value: DbrValue, severity: Severity, timestamp: SystemTime) -> Self {
        Self {
            value,
            severity,
            timestamp,
        }
    }

    pub fn value(&self) -> &DbrValue {
        &self.value
    }

    pub fn into_value(self) -> DbrValue {
        self.value
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Seconds since the UNIX epoch, including the fractional part
    pub fn timestamp_secs(&self) -> f64 {
        match self.timestamp.duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_secs_f64(),
            Err(before) => -before.duration().as_secs_f64(),
        }
    }

    /// Whole seconds and nanoseconds since the UNIX epoch
    pub fn timestamp_parts(&self) -> (u64, u32) {
        let since = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        (since.as_secs(), since.subsec_nanos())
    }

    /// The same envelope, stamped no earlier than `floor`
    pub fn not_before(mut self, floor: SystemTime) -> Envelope {
        self.timestamp = self.timestamp.max(floor);
        self
    }

    /// Build the event that stands in for a lost connection.
    ///
    /// Carries the previous value forward with `Invalid` severity. The
    /// timestamp is now, or one nanosecond after `previous` if the clock has
    /// not moved past it.
    pub fn disconnected_after(previous: &Envelope) -> Envelope {
        let now = SystemTime::now();
        let timestamp = if now > previous.timestamp {
            now
        } else {
            previous.timestamp + Duration::from_nanos(1)
        };
        Envelope {
            value: previous.value.clone(),
            severity: Severity::Invalid,
            timestamp,
        }
    }
}

impl From<Dbr> for Envelope {
    fn from(dbr: Dbr) -> Self {
        // Without alarm information assume valid, and without a timestamp use now
        let severity = dbr
            .status()
            .map_or(Severity::NoAlarm, |s| Severity::from_raw(s.severity));
        let timestamp = dbr.timestamp().unwrap_or_else(SystemTime::now);
        Envelope::new(dbr.take_value(), severity, timestamp)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time: DateTime<Local> = self.timestamp.into();
        write!(f, "{} ", time.format("%m/%d/%y %H:%M:%S%.9f"))?;
        match self.value.elements().as_slice() {
            [single] => {
                write!(f, "{single}")?;
                if self.severity != Severity::NoAlarm {
                    write!(f, " {}", self.severity)?;
                }
                Ok(())
            }
            many => {
                if self.severity != Severity::NoAlarm {
                    write!(f, "{} ", self.severity)?;
                }
                write!(f, "[{}]", many.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::Status;

    #[test]
    fn severity_from_raw() {
        assert_eq!(Severity::from_raw(0), Severity::NoAlarm);
        assert_eq!(Severity::from_raw(2), Severity::Major);
        assert_eq!(Severity::from_raw(3), Severity::Invalid);
        assert_eq!(Severity::from_raw(17), Severity::Invalid);
        assert_eq!(Severity::from_raw(-1), Severity::Invalid);
        assert!(Severity::Minor < Severity::Invalid);
    }

    #[test]
    fn from_time_dbr() {
        let ts = UNIX_EPOCH + Duration::new(1_700_000_000, 250);
        let env: Envelope = Dbr::Time {
            status: Status {
                status: 7,
                severity: 1,
            },
            timestamp: ts,
            value: DbrValue::Double(vec![1.5]),
        }
        .into();
        assert_eq!(env.severity(), Severity::Minor);
        assert_eq!(env.timestamp(), ts);
        assert_eq!(env.timestamp_parts(), (1_700_000_000, 250));
        assert!((env.timestamp_secs() - 1_700_000_000.000_000_25).abs() < 1e-6);
        assert_eq!(env.value(), &DbrValue::Double(vec![1.5]));
    }

    #[test]
    fn basic_dbr_is_valid_now() {
        let before = SystemTime::now();
        let env: Envelope = Dbr::Basic(DbrValue::Long(vec![3])).into();
        assert_eq!(env.severity(), Severity::NoAlarm);
        assert!(env.timestamp() >= before);
    }

    #[test]
    fn disconnect_timestamp_is_strictly_later() {
        // A previous update stamped in the future must still be exceeded
        let future = SystemTime::now() + Duration::from_secs(3600);
        let prev = Envelope::new(DbrValue::Long(vec![9]), Severity::NoAlarm, future);
        let synthetic = Envelope::disconnected_after(&prev);
        assert_eq!(synthetic.severity(), Severity::Invalid);
        assert_eq!(synthetic.value(), prev.value());
        assert_eq!(synthetic.timestamp(), future + Duration::from_nanos(1));

        let past = UNIX_EPOCH + Duration::from_secs(10);
        let prev = Envelope::new(DbrValue::Long(vec![9]), Severity::Major, past);
        assert!(Envelope::disconnected_after(&prev).timestamp() > past);
    }

    #[test]
    fn rendering() {
        let ts = SystemTime::now();
        let scalar = Envelope::new(DbrValue::Double(vec![4.5]), Severity::Major, ts);
        let text = scalar.to_string();
        assert!(text.ends_with(" 4.5 MAJOR_ALARM"), "{text}");

        let array = Envelope::new(DbrValue::Long(vec![1, 2, 3]), Severity::NoAlarm, ts);
        assert!(array.to_string().ends_with(" [1, 2, 3]"));

        let invalid = Envelope::new(DbrValue::Long(vec![1, 2]), Severity::Invalid, ts);
        assert!(invalid.to_string().ends_with(" INVALID_ALARM [1, 2]"));
    }
}
