//! Hybrid logical clocks for ordering events across processes.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ProtocolError;
use crate::rpc::UserProperty;

/// Timestamps further than this ahead of the local wall clock are rejected.
pub const DEFAULT_MAX_CLOCK_DRIFT: Duration = Duration::from_secs(60);

/// A wall clock time, a counter disambiguating events within the same millisecond,
/// and the ID of the node that produced it.
///
/// Encoded as `{millis since epoch, 15 digits}:{counter, 5 digits}:{node ID}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HybridLogicalClock {
    pub timestamp: SystemTime,
    pub counter: u64,
    pub node_id: String,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HlcError {
    #[error("malformed timestamp {0:?}")]
    Parse(String),

    #[error("timestamp is more than {max_drift:?} ahead of the local clock")]
    ClockDrift { max_drift: Duration },

    #[error("counter would overflow")]
    Overflow,
}

impl HybridLogicalClock {
    pub fn new(node_id: impl Into<String>) -> Self {
        HybridLogicalClock {
            timestamp: now_millis(),
            counter: 0,
            node_id: node_id.into(),
        }
    }

    /// Advance this clock past `other`, as when receiving a message stamped with it.
    pub fn update(&mut self, other: &HybridLogicalClock, max_drift: Duration) -> Result<(), HlcError> {
        let now = now_millis();

        if now > self.timestamp && now > other.timestamp {
            self.timestamp = now;
            self.counter = 0;
        } else if self.timestamp == other.timestamp {
            self.counter = self.counter.max(other.counter);
            self.increment()?;
        } else if self.timestamp > other.timestamp {
            self.increment()?;
        } else {
            self.timestamp = other.timestamp;
            self.counter = other.counter;
            self.increment()?;
        }

        self.validate(now, max_drift)
    }

    /// Advance this clock to the current time, as when sending a message.
    pub fn update_now(&mut self, max_drift: Duration) -> Result<(), HlcError> {
        let now = now_millis();

        if now > self.timestamp {
            self.timestamp = now;
            self.counter = 0;
        } else {
            self.increment()?;
        }

        self.validate(now, max_drift)
    }

    fn increment(&mut self) -> Result<(), HlcError> {
        self.counter = self.counter.checked_add(1).ok_or(HlcError::Overflow)?;
        Ok(())
    }

    fn validate(&self, now: SystemTime, max_drift: Duration) -> Result<(), HlcError> {
        match self.timestamp.duration_since(now) {
            Ok(drift) if drift > max_drift => Err(HlcError::ClockDrift { max_drift }),
            _ => Ok(()),
        }
    }
}

impl Display for HybridLogicalClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let millis = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        write!(f, "{millis:015}:{:05}:{}", self.counter, self.node_id)
    }
}

impl FromStr for HybridLogicalClock {
    type Err = HlcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_err = || HlcError::Parse(s.to_owned());

        let mut parts = s.splitn(3, ':');

        let millis: u64 = parts
            .next()
            .and_then(|millis| millis.parse().ok())
            .ok_or_else(parse_err)?;
        let counter: u64 = parts
            .next()
            .and_then(|counter| counter.parse().ok())
            .ok_or_else(parse_err)?;
        let node_id = parts.next().ok_or_else(parse_err)?;

        Ok(HybridLogicalClock {
            timestamp: UNIX_EPOCH + Duration::from_millis(millis),
            counter,
            node_id: node_id.to_owned(),
        })
    }
}

impl From<HlcError> for ProtocolError {
    fn from(e: HlcError) -> Self {
        match &e {
            HlcError::Parse(value) => {
                ProtocolError::header_invalid(UserProperty::Timestamp.as_str(), value.clone())
            }
            HlcError::ClockDrift { .. } => {
                ProtocolError::state_invalid(Some("MaxClockDrift".into()))
            }
            HlcError::Overflow => ProtocolError::internal_logic_error(Some("Counter".into())),
        }
        .with_message(e.to_string())
    }
}

/// The clock shared by every invoker and executor of an application.
#[derive(Debug)]
pub struct ApplicationHybridLogicalClock {
    hlc: Mutex<HybridLogicalClock>,
    max_clock_drift: Duration,
}

impl ApplicationHybridLogicalClock {
    pub fn new(max_clock_drift: Duration) -> Self {
        ApplicationHybridLogicalClock {
            hlc: Mutex::new(HybridLogicalClock::new(uuid::Uuid::new_v4().to_string())),
            max_clock_drift,
        }
    }

    /// Advance the clock to now and return its encoded value.
    pub fn update_now(&self) -> Result<String, HlcError> {
        let mut hlc = self.lock();
        hlc.update_now(self.max_clock_drift)?;
        Ok(hlc.to_string())
    }

    pub fn update(&self, other: &HybridLogicalClock) -> Result<(), HlcError> {
        self.lock().update(other, self.max_clock_drift)
    }

    pub fn read(&self) -> HybridLogicalClock {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, HybridLogicalClock> {
        self.hlc.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ApplicationHybridLogicalClock {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLOCK_DRIFT)
    }
}

/// The current time, truncated to whole milliseconds so it survives encoding.
fn now_millis() -> SystemTime {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    UNIX_EPOCH + Duration::from_millis(since_epoch.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use expect_test::expect;

    use super::{HlcError, HybridLogicalClock, DEFAULT_MAX_CLOCK_DRIFT};

    #[test]
    fn encoding() {
        let hlc = HybridLogicalClock {
            timestamp: UNIX_EPOCH + Duration::from_millis(1_700_000_000_123),
            counter: 42,
            node_id: "node:a".into(),
        };

        expect![[r#"001700000000123:00042:node:a"#]].assert_eq(&hlc.to_string());
        assert_eq!(hlc.to_string().parse::<HybridLogicalClock>(), Ok(hlc));

        assert!(matches!(
            "12:ab:node".parse::<HybridLogicalClock>(),
            Err(HlcError::Parse(_))
        ));
        assert!(matches!(
            "12".parse::<HybridLogicalClock>(),
            Err(HlcError::Parse(_))
        ));
    }

    #[test]
    fn update_from_future_remote() {
        let mut local = HybridLogicalClock::new("local");
        let mut remote = HybridLogicalClock::new("remote");
        remote.timestamp += Duration::from_secs(10);
        remote.counter = 3;

        local.update(&remote, DEFAULT_MAX_CLOCK_DRIFT).unwrap();
        assert_eq!(local.timestamp, remote.timestamp);
        assert_eq!(local.counter, 4);
        assert_eq!(local.node_id, "local");

        local.update_now(DEFAULT_MAX_CLOCK_DRIFT).unwrap();
        assert_eq!(local.counter, 5);
    }

    #[test]
    fn rejects_excessive_drift() {
        let mut local = HybridLogicalClock::new("local");
        let mut remote = HybridLogicalClock::new("remote");
        remote.timestamp += Duration::from_secs(120);

        assert_eq!(
            local.update(&remote, DEFAULT_MAX_CLOCK_DRIFT),
            Err(HlcError::ClockDrift {
                max_drift: DEFAULT_MAX_CLOCK_DRIFT
            })
        );
    }

    #[test]
    fn counter_overflow() {
        let mut local = HybridLogicalClock::new("local");
        local.timestamp += Duration::from_secs(30);
        local.counter = u64::MAX;

        assert_eq!(
            local.update_now(DEFAULT_MAX_CLOCK_DRIFT),
            Err(HlcError::Overflow)
        );
    }
}
