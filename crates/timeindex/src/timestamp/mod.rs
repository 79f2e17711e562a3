//! Tagged 64-bit timestamps.
//!
//! Every record in a store carries two timestamps. On disk each one is a
//! single `u64` whose high bits hold a prefix-coded tag selecting the scale
//! (seconds, milliseconds, microseconds, nanoseconds or caller-defined units)
//! and the variant (absolute instant or elapsed span). In memory a timestamp
//! is the [`Timestamp`] enum; the bit packing lives entirely in
//! [`codec`].
//!
//! # Example
//!
//! ```rust,ignore
//! use timeindex::timestamp::{Scale, Timestamp};
//!
//! let ts = Timestamp::absolute(Scale::Nanosecond, 5, 123_456_789)?;
//! let raw = ts.encode();
//! let back = Timestamp::decode(raw)?;
//! assert_eq!(back.seconds(), 5);
//! assert_eq!(back.nanoseconds(), 123_456_789);
//! ```

mod arith;
pub mod codec;

use crate::error::{Result, TimeIndexError};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use codec::Tag;

/// Units per second used when decoding a units-based timestamp without an
/// explicit rate (MPEG presentation-time units).
pub const DEFAULT_UNITS_PER_SECOND: u64 = 90_000;

/// Resolution of a standard timestamp scale.
///
/// Variants are declared coarsest first so the derived ordering ranks
/// finer scales higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scale {
    /// Whole seconds.
    Second,
    /// Milliseconds.
    Millisecond,
    /// Microseconds.
    Microsecond,
    /// Nanoseconds.
    Nanosecond,
}

impl Scale {
    /// Returns the number of units in one second.
    pub const fn units_per_second(self) -> u64 {
        match self {
            Self::Second => 1,
            Self::Millisecond => 1_000,
            Self::Microsecond => 1_000_000,
            Self::Nanosecond => 1_000_000_000,
        }
    }

    /// Returns the finer of two scales.
    pub fn finer(self, other: Self) -> Self {
        self.max(other)
    }

    /// Short lowercase name used in logs and error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Second => "s",
            Self::Millisecond => "ms",
            Self::Microsecond => "us",
            Self::Nanosecond => "ns",
        }
    }
}

/// A point in time or a span of time, in one of several resolutions.
///
/// Magnitudes are counted in units of the variant's resolution, i.e.
/// `seconds * units_per_second + sub_second_units`. Signs are kept apart from
/// the magnitude: absolute values before the Unix epoch set `before_epoch`,
/// elapsed values set `negative`. Only the absolute sign survives encoding;
/// an elapsed value always decodes as non-negative.
///
/// Values built through the constructors always fit their variant's bit
/// budget. Values assembled by hand can be checked with [`Timestamp::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Timestamp {
    /// The distinguished zero value (raw word `0`).
    #[default]
    Zero,
    /// An instant relative to the Unix epoch.
    Absolute {
        /// Resolution of `magnitude`.
        scale: Scale,
        /// True if the instant lies before the epoch.
        before_epoch: bool,
        /// Distance from the epoch in `scale` units.
        magnitude: u64,
    },
    /// A span of time in a standard scale.
    Elapsed {
        /// Resolution of `magnitude`.
        scale: Scale,
        /// In-memory sign; not stored on disk.
        negative: bool,
        /// Length of the span in `scale` units.
        magnitude: u64,
    },
    /// A span of time in caller-defined units.
    Units {
        /// Units in one second.
        units_per_second: u64,
        /// In-memory sign; not stored on disk.
        negative: bool,
        /// Length of the span in units.
        magnitude: u64,
    },
}

/// Resolution of a non-zero timestamp: a standard scale or a units rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Scale(Scale),
    Units(u64),
}

impl Resolution {
    pub(crate) fn per_second(self) -> u64 {
        match self {
            Self::Scale(scale) => scale.units_per_second(),
            Self::Units(ups) => ups,
        }
    }
}

impl Timestamp {
    /// The zero timestamp.
    pub const ZERO: Timestamp = Timestamp::Zero;

    /// Creates an absolute timestamp from whole seconds and sub-second units.
    ///
    /// `seconds` may be negative for instants before the epoch;
    /// `sub_second_units` is then measured away from the epoch, matching the
    /// sign of `seconds`.
    ///
    /// # Errors
    ///
    /// Returns `TimestampOverflow` if `sub_second_units` is not smaller than
    /// the scale's units per second or the magnitude exceeds the bit budget.
    pub fn absolute(scale: Scale, seconds: i64, sub_second_units: u64) -> Result<Self> {
        let ups = scale.units_per_second();
        if sub_second_units >= ups {
            return Err(TimeIndexError::TimestampOverflow {
                variant: "sub-second units",
                magnitude: sub_second_units as u128,
                max: ups - 1,
            });
        }
        let magnitude =
            (seconds.unsigned_abs() as u128) * (ups as u128) + sub_second_units as u128;
        Self::absolute_from_parts(scale, seconds < 0, magnitude)
    }

    /// Creates an absolute timestamp counting seconds from the epoch.
    pub fn from_secs(secs: i64) -> Result<Self> {
        Self::from_signed_absolute(Scale::Second, secs)
    }

    /// Creates an absolute timestamp counting milliseconds from the epoch.
    pub fn from_millis(millis: i64) -> Result<Self> {
        Self::from_signed_absolute(Scale::Millisecond, millis)
    }

    /// Creates an absolute timestamp counting microseconds from the epoch.
    pub fn from_micros(micros: i64) -> Result<Self> {
        Self::from_signed_absolute(Scale::Microsecond, micros)
    }

    /// Creates an absolute timestamp counting nanoseconds from the epoch.
    pub fn from_nanos(nanos: i64) -> Result<Self> {
        Self::from_signed_absolute(Scale::Nanosecond, nanos)
    }

    /// Creates an elapsed timestamp of `value` units of `scale`.
    pub fn elapsed(scale: Scale, value: i64) -> Result<Self> {
        Self::build(false, Resolution::Scale(scale), value as i128)
    }

    /// Creates an elapsed timestamp in caller-defined units.
    ///
    /// # Errors
    ///
    /// Returns `TimestampOverflow` if `units_per_second` is zero or the value
    /// exceeds the units variant's bit budget.
    pub fn units(units_per_second: u64, value: i64) -> Result<Self> {
        if units_per_second == 0 {
            return Err(TimeIndexError::TimestampOverflow {
                variant: "units per second",
                magnitude: 0,
                max: 0,
            });
        }
        Self::build(false, Resolution::Units(units_per_second), value as i128)
    }

    /// Returns the current wall-clock time at nanosecond resolution.
    pub fn now() -> Result<Self> {
        Self::from_system_time(SystemTime::now())
    }

    /// Converts a `SystemTime` to an absolute nanosecond timestamp.
    pub fn from_system_time(time: SystemTime) -> Result<Self> {
        let (before_epoch, span) = match time.duration_since(UNIX_EPOCH) {
            Ok(d) => (false, d),
            Err(e) => (true, e.duration()),
        };
        Self::absolute_from_parts(Scale::Nanosecond, before_epoch, span.as_nanos())
    }

    /// Converts an absolute timestamp back to a `SystemTime`.
    ///
    /// Returns `None` for elapsed and units values.
    pub fn to_system_time(&self) -> Option<SystemTime> {
        match *self {
            Self::Zero => Some(UNIX_EPOCH),
            Self::Absolute {
                scale,
                before_epoch,
                magnitude,
            } => {
                let ups = scale.units_per_second();
                let nanos_per_unit = 1_000_000_000 / ups;
                let span = Duration::from_secs(magnitude / ups)
                    + Duration::from_nanos((magnitude % ups) * nanos_per_unit);
                if before_epoch {
                    UNIX_EPOCH.checked_sub(span)
                } else {
                    UNIX_EPOCH.checked_add(span)
                }
            }
            _ => None,
        }
    }

    /// Checks that the value fits the bit budget of its variant.
    pub fn validate(&self) -> Result<()> {
        match (self.tag(), self.magnitude()) {
            (None, _) => Ok(()),
            (Some(tag), magnitude) if magnitude <= tag.max_magnitude() => match *self {
                Self::Units {
                    units_per_second: 0,
                    ..
                } => Err(TimeIndexError::TimestampOverflow {
                    variant: "units per second",
                    magnitude: 0,
                    max: 0,
                }),
                _ => Ok(()),
            },
            (Some(tag), magnitude) => Err(TimeIndexError::TimestampOverflow {
                variant: tag.name(),
                magnitude: magnitude as u128,
                max: tag.max_magnitude(),
            }),
        }
    }

    /// Returns the wire tag of this value, or `None` for zero.
    pub fn tag(&self) -> Option<Tag> {
        Tag::of(self)
    }

    /// Returns true for the zero sentinel.
    pub fn is_zero(&self) -> bool {
        matches!(self, Self::Zero)
    }

    /// Returns true for absolute instants (zero counts as the epoch).
    pub fn is_absolute(&self) -> bool {
        matches!(self, Self::Zero | Self::Absolute { .. })
    }

    /// Returns true if the value is before the epoch or a negative span.
    pub fn is_negative(&self) -> bool {
        match *self {
            Self::Zero => false,
            Self::Absolute { before_epoch, .. } => before_epoch,
            Self::Elapsed { negative, .. } | Self::Units { negative, .. } => negative,
        }
    }

    /// Returns the standard scale, or `None` for zero and units values.
    pub fn scale(&self) -> Option<Scale> {
        match *self {
            Self::Absolute { scale, .. } | Self::Elapsed { scale, .. } => Some(scale),
            _ => None,
        }
    }

    /// Returns the number of units in one second for this value.
    ///
    /// Zero reports 1.
    pub fn units_per_second(&self) -> u64 {
        self.resolution().map_or(1, Resolution::per_second)
    }

    /// Returns the unsigned magnitude in the value's own units.
    pub fn magnitude(&self) -> u64 {
        match *self {
            Self::Zero => 0,
            Self::Absolute { magnitude, .. }
            | Self::Elapsed { magnitude, .. }
            | Self::Units { magnitude, .. } => magnitude,
        }
    }

    /// Returns whole seconds, truncated toward zero and carrying the sign.
    pub fn seconds(&self) -> i64 {
        let secs = (self.magnitude() / self.units_per_second()) as i64;
        if self.is_negative() {
            -secs
        } else {
            secs
        }
    }

    /// Returns the sub-second remainder in the value's own units.
    ///
    /// The remainder is unsigned; combine it with [`Timestamp::is_negative`].
    pub fn sub_second_units(&self) -> u64 {
        self.magnitude() % self.units_per_second()
    }

    /// Returns the sub-second remainder expressed in nanoseconds.
    pub fn nanoseconds(&self) -> u32 {
        let ups = self.units_per_second() as u128;
        ((self.sub_second_units() as u128 * 1_000_000_000) / ups) as u32
    }

    pub(crate) fn resolution(&self) -> Option<Resolution> {
        match *self {
            Self::Zero => None,
            Self::Absolute { scale, .. } | Self::Elapsed { scale, .. } => {
                Some(Resolution::Scale(scale))
            }
            Self::Units {
                units_per_second, ..
            } => Some(Resolution::Units(units_per_second)),
        }
    }

    fn from_signed_absolute(scale: Scale, value: i64) -> Result<Self> {
        Self::build(true, Resolution::Scale(scale), value as i128)
    }

    fn absolute_from_parts(scale: Scale, before_epoch: bool, magnitude: u128) -> Result<Self> {
        let signed = if before_epoch {
            -(magnitude as i128)
        } else {
            magnitude as i128
        };
        Self::build(true, Resolution::Scale(scale), signed)
    }

    /// Builds a timestamp from a signed magnitude, checking the bit budget.
    ///
    /// Absolute values at a units resolution are not representable and are
    /// rebuilt at nanosecond resolution.
    pub(crate) fn build(absolute: bool, resolution: Resolution, value: i128) -> Result<Self> {
        let negative = value < 0;
        let magnitude_wide = value.unsigned_abs();

        let candidate_magnitude = |tag: Tag| -> Result<u64> {
            if magnitude_wide > tag.max_magnitude() as u128 {
                return Err(TimeIndexError::TimestampOverflow {
                    variant: tag.name(),
                    magnitude: magnitude_wide,
                    max: tag.max_magnitude(),
                });
            }
            Ok(magnitude_wide as u64)
        };

        match (absolute, resolution) {
            (true, Resolution::Scale(scale)) => {
                let magnitude = candidate_magnitude(Tag::absolute(scale))?;
                Ok(Self::Absolute {
                    scale,
                    before_epoch: negative && magnitude != 0,
                    magnitude,
                })
            }
            (true, Resolution::Units(ups)) => {
                let nanos = value * 1_000_000_000 / ups as i128;
                Self::build(true, Resolution::Scale(Scale::Nanosecond), nanos)
            }
            (false, Resolution::Scale(scale)) => {
                let magnitude = candidate_magnitude(Tag::elapsed(scale))?;
                Ok(Self::Elapsed {
                    scale,
                    negative: negative && magnitude != 0,
                    magnitude,
                })
            }
            (false, Resolution::Units(units_per_second)) => {
                let magnitude = candidate_magnitude(Tag::ElapsedUnits)?;
                Ok(Self::Units {
                    units_per_second,
                    negative: negative && magnitude != 0,
                    magnitude,
                })
            }
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.is_negative() { "-" } else { "" };
        match *self {
            Self::Zero => write!(f, "0"),
            Self::Absolute { scale, .. } | Self::Elapsed { scale, .. } => {
                let secs = self.magnitude() / scale.units_per_second();
                let suffix = if self.is_absolute() { "" } else { " elapsed" };
                match scale {
                    Scale::Second => write!(f, "{}{}s{}", sign, secs, suffix),
                    Scale::Millisecond => {
                        write!(f, "{}{}.{:03}s{}", sign, secs, self.sub_second_units(), suffix)
                    }
                    Scale::Microsecond => {
                        write!(f, "{}{}.{:06}s{}", sign, secs, self.sub_second_units(), suffix)
                    }
                    Scale::Nanosecond => {
                        write!(f, "{}{}.{:09}s{}", sign, secs, self.sub_second_units(), suffix)
                    }
                }
            }
            Self::Units {
                units_per_second,
                magnitude,
                ..
            } => write!(f, "{}{}/{}s elapsed", sign, magnitude, units_per_second),
        }
    }
}

/// A half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Inclusive lower bound.
    pub start: Timestamp,
    /// Exclusive upper bound.
    pub end: Timestamp,
}

impl TimeRange {
    /// Creates a new time range.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Returns true if `ts` falls inside the range.
    pub fn contains(&self, ts: &Timestamp) -> bool {
        ts.greater_than_equals(&self.start) && ts.less_than(&self.end)
    }

    /// Returns true if the range covers no instant.
    pub fn is_empty(&self) -> bool {
        self.end.less_than_equals(&self.start)
    }
}
