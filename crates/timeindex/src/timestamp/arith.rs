//! Arithmetic and ordering over timestamps.
//!
//! Mixed-resolution operations promote to the finer of the two operands.
//! Comparisons cross-multiply by each side's units per second, so they are
//! exact even between a standard scale and a units rate that does not divide
//! it.

use super::{Resolution, Scale, Timestamp};
use crate::error::Result;
use std::cmp::Ordering;

impl Timestamp {
    /// Signed magnitude in the value's own units.
    fn signed(&self) -> i128 {
        let magnitude = self.magnitude() as i128;
        if self.is_negative() {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Signed magnitude converted to `target`, truncating toward zero.
    fn signed_at(&self, target: Resolution) -> i128 {
        let from = self.units_per_second() as i128;
        let to = target.per_second() as i128;
        if from == to {
            self.signed()
        } else {
            self.signed() * to / from
        }
    }

    /// Finer resolution of two operands; zero takes the other side's.
    fn common_resolution(&self, other: &Timestamp) -> Option<Resolution> {
        match (self.resolution(), other.resolution()) {
            (None, None) => None,
            (Some(r), None) | (None, Some(r)) => Some(r),
            (Some(a), Some(b)) => {
                if b.per_second() > a.per_second() {
                    Some(b)
                } else {
                    Some(a)
                }
            }
        }
    }

    /// Adds two timestamps.
    ///
    /// The result is absolute if either operand is absolute, otherwise
    /// elapsed, and is expressed at the finer operand's resolution.
    ///
    /// # Errors
    ///
    /// Returns `TimestampOverflow` if the sum exceeds the result's bit budget.
    pub fn checked_add(&self, other: &Timestamp) -> Result<Timestamp> {
        let Some(target) = self.common_resolution(other) else {
            return Ok(Timestamp::Zero);
        };
        let sum = self.signed_at(target) + other.signed_at(target);
        let absolute = matches!(self, Timestamp::Absolute { .. })
            || matches!(other, Timestamp::Absolute { .. });
        Timestamp::build(absolute, target, sum)
    }

    /// Subtracts `other` from `self`.
    ///
    /// Absolute minus absolute is an elapsed span; absolute minus elapsed is
    /// absolute; anything else is elapsed.
    ///
    /// # Errors
    ///
    /// Returns `TimestampOverflow` if the difference exceeds the result's
    /// bit budget.
    pub fn checked_sub(&self, other: &Timestamp) -> Result<Timestamp> {
        let Some(target) = self.common_resolution(other) else {
            return Ok(Timestamp::Zero);
        };
        let difference = self.signed_at(target) - other.signed_at(target);
        let absolute = matches!(self, Timestamp::Absolute { .. })
            && !matches!(other, Timestamp::Absolute { .. });
        Timestamp::build(absolute, target, difference)
    }

    /// Time elapsed from this reference until now.
    ///
    /// The wall clock is sampled at nanosecond resolution; the result is an
    /// elapsed value at the reference's own resolution.
    pub fn elapsed_since(&self) -> Result<Timestamp> {
        self.elapsed_until(&Timestamp::now()?)
    }

    /// Time elapsed from this reference until `now`, at this reference's
    /// resolution.
    pub(crate) fn elapsed_until(&self, now: &Timestamp) -> Result<Timestamp> {
        let nanos = Resolution::Scale(Scale::Nanosecond);
        let span = now.signed_at(nanos) - self.signed_at(nanos);
        let target = self.resolution().unwrap_or(nanos);
        let converted = span * target.per_second() as i128 / 1_000_000_000;
        Timestamp::build(false, target, converted)
    }

    /// Total order on the signed time value.
    pub fn compare(&self, other: &Timestamp) -> Ordering {
        let lhs = self.signed() * other.units_per_second() as i128;
        let rhs = other.signed() * self.units_per_second() as i128;
        lhs.cmp(&rhs)
    }

    /// Returns true if `self` is strictly earlier than `other`.
    pub fn less_than(&self, other: &Timestamp) -> bool {
        self.compare(other) == Ordering::Less
    }

    /// Returns true if `self` is earlier than or equal to `other`.
    pub fn less_than_equals(&self, other: &Timestamp) -> bool {
        self.compare(other) != Ordering::Greater
    }

    /// Returns true if `self` is strictly later than `other`.
    pub fn greater_than(&self, other: &Timestamp) -> bool {
        self.compare(other) == Ordering::Greater
    }

    /// Returns true if `self` is later than or equal to `other`.
    pub fn greater_than_equals(&self, other: &Timestamp) -> bool {
        self.compare(other) != Ordering::Less
    }

    /// Returns true if both values denote the same time, whatever their
    /// resolution.
    pub fn time_equals(&self, other: &Timestamp) -> bool {
        self.compare(other) == Ordering::Equal
    }

    /// Returns the earlier of two timestamps.
    pub fn earliest(self, other: Timestamp) -> Timestamp {
        if other.less_than(&self) {
            other
        } else {
            self
        }
    }

    /// Returns the later of two timestamps.
    pub fn latest(self, other: Timestamp) -> Timestamp {
        if other.greater_than(&self) {
            other
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeIndexError;

    #[test]
    fn test_mixed_scale_add_promotes() {
        let a = Timestamp::from_millis(1_500).unwrap();
        let b = Timestamp::elapsed(Scale::Microsecond, 250).unwrap();
        let sum = a.checked_add(&b).unwrap();
        assert_eq!(sum, Timestamp::from_micros(1_500_250).unwrap());
    }

    #[test]
    fn test_absolute_minus_absolute_is_elapsed() {
        let a = Timestamp::from_secs(10).unwrap();
        let b = Timestamp::from_nanos(2_500_000_000).unwrap();
        let diff = a.checked_sub(&b).unwrap();
        assert_eq!(diff, Timestamp::elapsed(Scale::Nanosecond, 7_500_000_000).unwrap());

        let back = b.checked_sub(&a).unwrap();
        assert!(back.is_negative());
        assert_eq!(back.seconds(), -7);
    }

    #[test]
    fn test_absolute_minus_elapsed_is_absolute() {
        let a = Timestamp::from_millis(1_000).unwrap();
        let b = Timestamp::elapsed(Scale::Millisecond, 1_500).unwrap();
        let before = a.checked_sub(&b).unwrap();
        assert!(before.is_absolute());
        assert!(before.is_negative());
        assert_eq!(before.magnitude(), 500);
    }

    #[test]
    fn test_zero_is_identity() {
        let a = Timestamp::from_micros(77).unwrap();
        assert_eq!(a.checked_add(&Timestamp::Zero).unwrap(), a);
        assert_eq!(Timestamp::Zero.checked_add(&a).unwrap(), a);
        assert_eq!(Timestamp::Zero.checked_add(&Timestamp::Zero).unwrap(), Timestamp::Zero);
    }

    #[test]
    fn test_units_promotion() {
        // 90 kHz is finer than milliseconds.
        let units = Timestamp::units(90_000, 90).unwrap();
        let millis = Timestamp::elapsed(Scale::Millisecond, 1).unwrap();
        let sum = millis.checked_add(&units).unwrap();
        assert_eq!(sum, Timestamp::units(90_000, 180).unwrap());
    }

    #[test]
    fn test_absolute_plus_units_lands_on_nanos() {
        let abs = Timestamp::from_millis(1).unwrap();
        let units = Timestamp::units(90_000, 90).unwrap();
        let sum = abs.checked_add(&units).unwrap();
        assert_eq!(sum, Timestamp::from_nanos(2_000_000).unwrap());
    }

    #[test]
    fn test_overflowing_sum_rejected() {
        let max = Timestamp::Elapsed {
            scale: Scale::Nanosecond,
            negative: false,
            magnitude: super::super::Tag::ElapsedNanos.max_magnitude(),
        };
        let one = Timestamp::elapsed(Scale::Nanosecond, 1).unwrap();
        assert!(matches!(
            max.checked_add(&one),
            Err(TimeIndexError::TimestampOverflow { .. })
        ));
    }

    #[test]
    fn test_compare_across_scales() {
        let ms = Timestamp::from_millis(200).unwrap();
        let us = Timestamp::from_micros(200_000).unwrap();
        let ns = Timestamp::from_nanos(200_000_001).unwrap();
        assert!(ms.time_equals(&us));
        assert_ne!(ms, us);
        assert!(ms.less_than(&ns));
        assert!(ns.greater_than_equals(&us));
        assert!(Timestamp::from_secs(-1).unwrap().less_than(&Timestamp::Zero));
    }

    #[test]
    fn test_compare_units_exact() {
        // 1/3 s at 3 Hz against 333 ms: the units value is later.
        let third = Timestamp::units(3, 1).unwrap();
        let ms = Timestamp::elapsed(Scale::Millisecond, 333).unwrap();
        assert!(ms.less_than(&third));
    }

    #[test]
    fn test_elapsed_until_uses_reference_scale() {
        let reference = Timestamp::from_millis(1_000).unwrap();
        let now = Timestamp::from_nanos(3_750_000_000).unwrap();
        let span = reference.elapsed_until(&now).unwrap();
        assert_eq!(span, Timestamp::elapsed(Scale::Millisecond, 2_750).unwrap());
    }

    #[test]
    fn test_elapsed_since_is_positive_for_past_reference() {
        let reference = Timestamp::from_secs(1_000_000_000).unwrap();
        let span = reference.elapsed_since().unwrap();
        assert!(!span.is_negative());
        assert_eq!(span.scale(), Some(Scale::Second));
        assert!(span.seconds() > 0);
    }

    #[test]
    fn test_earliest_latest() {
        let a = Timestamp::from_millis(5).unwrap();
        let b = Timestamp::from_micros(4_999).unwrap();
        assert_eq!(a.earliest(b), b);
        assert_eq!(a.latest(b), a);
    }
}
