use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wall-clock milliseconds since the Unix epoch.
///
/// Serialized as an RFC 3339 / ISO-8601 string with millisecond precision,
/// which is the shape the remote record and export files use on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(&self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as u64))
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0 as i64).unwrap_or_default()
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis().max(0) as u64)
    }

    pub fn to_rfc3339(&self) -> String {
        self.to_datetime()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let dt = DateTime::parse_from_rfc3339(&s).map_err(serde::de::Error::custom)?;
        Ok(Self::from_datetime(dt.with_timezone(&Utc)))
    }
}

/// Source of wall-clock time. Injected everywhere time is read so that tests
/// can drive timers with a [`ManualClock`].
pub trait Clock {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        // A clock set before 1970 reads as the epoch.
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Timestamp(ms)
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now_ms: Rc::new(Cell::new(start.0)),
        }
    }

    pub fn set(&self, t: Timestamp) {
        self.now_ms.set(t.0);
    }

    pub fn advance(&self, d: Duration) {
        self.now_ms
            .set(self.now_ms.get().saturating_add(d.as_millis() as u64));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now_ms.get())
    }
}

/// Produces strictly increasing timestamps on top of a wall clock.
///
/// Two writes in the same millisecond (or a wall clock stepping backwards)
/// still get distinct, ordered timestamps.
pub struct LocalClock {
    clock: Rc<dyn Clock>,
    last_ms: Cell<u64>,
}

impl LocalClock {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            last_ms: Cell::new(0),
        }
    }

    /// Current wall-clock reading, without the monotonic bump.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Next monotonically increasing timestamp.
    pub fn tick(&self) -> Timestamp {
        let now = self.clock.now().0;
        let last = self.last_ms.get();
        let next = if now > last { now } else { last + 1 };
        self.last_ms.set(next);
        Timestamp(next)
    }

    /// Fold in a timestamp seen from elsewhere, so the next [`tick`] orders
    /// after it even when the local wall clock lags behind.
    ///
    /// [`tick`]: LocalClock::tick
    pub fn observe(&self, seen: Timestamp) {
        if seen.0 > self.last_ms.get() {
            self.last_ms.set(seen.0);
        }
    }
}
