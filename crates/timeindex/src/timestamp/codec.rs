//! Bit packing of [`Timestamp`] values into 64-bit words.
//!
//! ## Tag layout
//!
//! Tags are a prefix code read from the most significant bits. Hot-path
//! absolute variants get 2-bit tags; rarer variants widen to 4, 6 and 8 bits.
//! Absolute variants spend the bit after the tag on the before-epoch flag.
//!
//! ```text
//! 01        absolute ms      sign + 61 magnitude bits
//! 10        absolute us      sign + 61
//! 11        absolute ns      sign + 61
//! 0001      elapsed ms              60
//! 0010      elapsed us              60
//! 0011      absolute s       sign + 59
//! 000001    elapsed ns              58
//! 000010    elapsed s               58
//! 000011    spare
//! 00000001  elapsed units           56
//! 00000010  spare
//! 00000011  spare
//! 00000000  zero sentinel (raw word 0 only)
//! ```

use super::{Scale, Timestamp, DEFAULT_UNITS_PER_SECOND};
use crate::error::{Result, TimeIndexError};

/// Wire tag of a non-zero timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Absolute milliseconds.
    AbsoluteMillis,
    /// Absolute microseconds.
    AbsoluteMicros,
    /// Absolute nanoseconds.
    AbsoluteNanos,
    /// Absolute seconds.
    AbsoluteSeconds,
    /// Elapsed milliseconds.
    ElapsedMillis,
    /// Elapsed microseconds.
    ElapsedMicros,
    /// Elapsed nanoseconds.
    ElapsedNanos,
    /// Elapsed seconds.
    ElapsedSeconds,
    /// Elapsed caller-defined units.
    ElapsedUnits,
}

impl Tag {
    /// Returns `(tag width in bits, tag pattern, carries a sign bit)`.
    const fn layout(self) -> (u32, u64, bool) {
        match self {
            Self::AbsoluteMillis => (2, 0b01, true),
            Self::AbsoluteMicros => (2, 0b10, true),
            Self::AbsoluteNanos => (2, 0b11, true),
            Self::ElapsedMillis => (4, 0b0001, false),
            Self::ElapsedMicros => (4, 0b0010, false),
            Self::AbsoluteSeconds => (4, 0b0011, true),
            Self::ElapsedNanos => (6, 0b00_0001, false),
            Self::ElapsedSeconds => (6, 0b00_0010, false),
            Self::ElapsedUnits => (8, 0b0000_0001, false),
        }
    }

    /// Returns the tag of an absolute value at `scale`.
    pub const fn absolute(scale: Scale) -> Self {
        match scale {
            Scale::Second => Self::AbsoluteSeconds,
            Scale::Millisecond => Self::AbsoluteMillis,
            Scale::Microsecond => Self::AbsoluteMicros,
            Scale::Nanosecond => Self::AbsoluteNanos,
        }
    }

    /// Returns the tag of an elapsed value at `scale`.
    pub const fn elapsed(scale: Scale) -> Self {
        match scale {
            Scale::Second => Self::ElapsedSeconds,
            Scale::Millisecond => Self::ElapsedMillis,
            Scale::Microsecond => Self::ElapsedMicros,
            Scale::Nanosecond => Self::ElapsedNanos,
        }
    }

    /// Returns the tag a timestamp encodes with, or `None` for zero.
    pub fn of(ts: &Timestamp) -> Option<Self> {
        match *ts {
            Timestamp::Zero => None,
            Timestamp::Absolute { scale, .. } => Some(Self::absolute(scale)),
            Timestamp::Elapsed { scale, .. } => Some(Self::elapsed(scale)),
            Timestamp::Units { .. } => Some(Self::ElapsedUnits),
        }
    }

    /// Number of bits left for the magnitude.
    pub const fn magnitude_bits(self) -> u32 {
        let (width, _, signed) = self.layout();
        64 - width - signed as u32
    }

    /// Largest magnitude this tag can carry.
    pub const fn max_magnitude(self) -> u64 {
        (1u64 << self.magnitude_bits()) - 1
    }

    /// Human-readable variant name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::AbsoluteMillis => "absolute ms",
            Self::AbsoluteMicros => "absolute us",
            Self::AbsoluteNanos => "absolute ns",
            Self::AbsoluteSeconds => "absolute s",
            Self::ElapsedMillis => "elapsed ms",
            Self::ElapsedMicros => "elapsed us",
            Self::ElapsedNanos => "elapsed ns",
            Self::ElapsedSeconds => "elapsed s",
            Self::ElapsedUnits => "elapsed units",
        }
    }

    /// Reads the tag from the high bits of a non-zero raw word.
    fn from_raw(raw: u64) -> Result<Self> {
        let tag = match raw >> 62 {
            0b01 => Self::AbsoluteMillis,
            0b10 => Self::AbsoluteMicros,
            0b11 => Self::AbsoluteNanos,
            _ => match raw >> 60 {
                0b0001 => Self::ElapsedMillis,
                0b0010 => Self::ElapsedMicros,
                0b0011 => Self::AbsoluteSeconds,
                _ => match raw >> 58 {
                    0b00_0001 => Self::ElapsedNanos,
                    0b00_0010 => Self::ElapsedSeconds,
                    0b00_0011 => return Err(TimeIndexError::UnknownTimestampTag(raw)),
                    _ => match raw >> 56 {
                        0b0000_0001 => Self::ElapsedUnits,
                        _ => return Err(TimeIndexError::UnknownTimestampTag(raw)),
                    },
                },
            },
        };
        Ok(tag)
    }
}

/// Packs a timestamp into its 64-bit wire form.
///
/// The value must fit its variant's budget (see [`Timestamp::validate`]);
/// constructors guarantee this. Elapsed signs are dropped.
pub fn encode(ts: &Timestamp) -> u64 {
    let Some(tag) = Tag::of(ts) else {
        return 0;
    };
    debug_assert!(ts.validate().is_ok(), "encoding out-of-budget timestamp {:?}", ts);

    let (width, pattern, signed) = tag.layout();
    let mut raw = pattern << (64 - width);
    if signed && ts.is_negative() {
        raw |= 1u64 << (63 - width);
    }
    raw | (ts.magnitude() & tag.max_magnitude())
}

/// Unpacks a 64-bit wire word, decoding units values at `units_per_second`.
///
/// # Errors
///
/// Returns `UnknownTimestampTag` for spare tags and for non-zero words under
/// the zero tag. Words produced by [`encode`] never fail.
pub fn decode(raw: u64, units_per_second: u64) -> Result<Timestamp> {
    if raw == 0 {
        return Ok(Timestamp::Zero);
    }

    let tag = Tag::from_raw(raw)?;
    let (width, _, signed) = tag.layout();
    let magnitude = raw & tag.max_magnitude();
    let sign = signed && (raw >> (63 - width)) & 1 == 1;

    let ts = match tag {
        Tag::AbsoluteMillis => absolute(Scale::Millisecond, sign, magnitude),
        Tag::AbsoluteMicros => absolute(Scale::Microsecond, sign, magnitude),
        Tag::AbsoluteNanos => absolute(Scale::Nanosecond, sign, magnitude),
        Tag::AbsoluteSeconds => absolute(Scale::Second, sign, magnitude),
        Tag::ElapsedMillis => elapsed(Scale::Millisecond, magnitude),
        Tag::ElapsedMicros => elapsed(Scale::Microsecond, magnitude),
        Tag::ElapsedNanos => elapsed(Scale::Nanosecond, magnitude),
        Tag::ElapsedSeconds => elapsed(Scale::Second, magnitude),
        Tag::ElapsedUnits => Timestamp::Units {
            units_per_second,
            negative: false,
            magnitude,
        },
    };
    Ok(ts)
}

fn absolute(scale: Scale, before_epoch: bool, magnitude: u64) -> Timestamp {
    Timestamp::Absolute {
        scale,
        before_epoch: before_epoch && magnitude != 0,
        magnitude,
    }
}

fn elapsed(scale: Scale, magnitude: u64) -> Timestamp {
    Timestamp::Elapsed {
        scale,
        negative: false,
        magnitude,
    }
}

impl Timestamp {
    /// Packs this timestamp into its 64-bit wire form.
    pub fn encode(&self) -> u64 {
        encode(self)
    }

    /// Decodes a wire word, using [`DEFAULT_UNITS_PER_SECOND`] for units values.
    pub fn decode(raw: u64) -> Result<Self> {
        decode(raw, DEFAULT_UNITS_PER_SECOND)
    }

    /// Decodes a wire word, using `units_per_second` for units values.
    pub fn decode_with_units(raw: u64, units_per_second: u64) -> Result<Self> {
        decode(raw, units_per_second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_prefix_free() {
        let tags = [
            Tag::AbsoluteMillis,
            Tag::AbsoluteMicros,
            Tag::AbsoluteNanos,
            Tag::AbsoluteSeconds,
            Tag::ElapsedMillis,
            Tag::ElapsedMicros,
            Tag::ElapsedNanos,
            Tag::ElapsedSeconds,
            Tag::ElapsedUnits,
        ];
        for a in tags {
            for b in tags {
                if a == b {
                    continue;
                }
                let (wa, pa, _) = a.layout();
                let (wb, pb, _) = b.layout();
                let (short, long, shift) = if wa <= wb {
                    (pa, pb, wb - wa)
                } else {
                    (pb, pa, wa - wb)
                };
                assert_ne!(long >> shift, short, "{:?} is a prefix of {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_zero_raw_is_sentinel() {
        assert_eq!(decode(0, DEFAULT_UNITS_PER_SECOND).unwrap(), Timestamp::Zero);
        assert_eq!(encode(&Timestamp::Zero), 0);
    }

    #[test]
    fn test_zero_magnitude_is_not_sentinel() {
        let ts = Timestamp::from_millis(0).unwrap();
        let raw = ts.encode();
        assert_ne!(raw, 0);
        assert_eq!(Timestamp::decode(raw).unwrap(), ts);
    }

    #[test]
    fn test_spare_tags_rejected() {
        let spare6 = 0b00_0011u64 << 58;
        let spare8a = 0b0000_0010u64 << 56;
        let spare8b = 0b0000_0011u64 << 56;
        let under_zero_tag = 1u64;
        for raw in [spare6, spare8a, spare8b, under_zero_tag] {
            assert!(matches!(
                Timestamp::decode(raw),
                Err(TimeIndexError::UnknownTimestampTag(r)) if r == raw
            ));
        }
    }

    #[test]
    fn test_sign_bit_position() {
        let ts = Timestamp::from_nanos(-1).unwrap();
        let raw = ts.encode();
        assert_eq!(raw >> 62, 0b11);
        assert_eq!((raw >> 61) & 1, 1);
        assert_eq!(raw & Tag::AbsoluteNanos.max_magnitude(), 1);
    }

    #[test]
    fn test_elapsed_sign_not_stored() {
        let ts = Timestamp::elapsed(Scale::Millisecond, -250).unwrap();
        let back = Timestamp::decode(ts.encode()).unwrap();
        assert!(!back.is_negative());
        assert_eq!(back.magnitude(), 250);
    }

    #[test]
    fn test_units_decode_with_rate() {
        let ts = Timestamp::units(48_000, 96_000).unwrap();
        let back = Timestamp::decode_with_units(ts.encode(), 48_000).unwrap();
        assert_eq!(back, ts);
        assert_eq!(back.seconds(), 2);
    }

    #[test]
    fn test_max_magnitude_roundtrip() {
        for scale in [
            Scale::Second,
            Scale::Millisecond,
            Scale::Microsecond,
            Scale::Nanosecond,
        ] {
            let max = Tag::absolute(scale).max_magnitude();
            let ts = Timestamp::Absolute {
                scale,
                before_epoch: true,
                magnitude: max,
            };
            assert_eq!(Timestamp::decode(ts.encode()).unwrap(), ts);

            let max = Tag::elapsed(scale).max_magnitude();
            let ts = Timestamp::Elapsed {
                scale,
                negative: false,
                magnitude: max,
            };
            assert_eq!(Timestamp::decode(ts.encode()).unwrap(), ts);
        }
    }
}
