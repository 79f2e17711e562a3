//! Property tests for the timestamp codec and the item cache.
//!
//! Uses proptest to verify that every representable timestamp survives its
//! 64-bit wire form and that volume-bounded eviction holds for arbitrary
//! payload sequences.

use proptest::prelude::*;
use timeindex::cache::ItemCache;
use timeindex::{EvictAction, IndexItem, Scale, Timestamp, VolumePolicy};

const UNITS_PER_SECOND: u64 = 90_000;

fn scale_strategy() -> impl Strategy<Value = Scale> {
    prop_oneof![
        Just(Scale::Second),
        Just(Scale::Millisecond),
        Just(Scale::Microsecond),
        Just(Scale::Nanosecond),
    ]
}

/// Absolute values within the smallest absolute budget (58 bits).
fn absolute_strategy() -> impl Strategy<Value = Timestamp> {
    (scale_strategy(), -(1i64 << 57)..(1i64 << 57)).prop_map(|(scale, value)| {
        let ups = scale.units_per_second() as i64;
        let seconds = value / ups;
        let sub = (value % ups).unsigned_abs();
        Timestamp::absolute(scale, seconds, sub).unwrap()
    })
}

/// Non-negative elapsed values; signs are not carried on the wire.
fn elapsed_strategy() -> impl Strategy<Value = Timestamp> {
    prop_oneof![
        (scale_strategy(), 0i64..(1i64 << 57))
            .prop_map(|(scale, value)| Timestamp::elapsed(scale, value).unwrap()),
        (0i64..(1i64 << 55))
            .prop_map(|value| Timestamp::units(UNITS_PER_SECOND, value).unwrap()),
    ]
}

proptest! {
    /// Absolute timestamps keep scale, sign and magnitude.
    #[test]
    fn test_absolute_roundtrip_proptest(ts in absolute_strategy()) {
        let raw = ts.encode();
        let decoded = Timestamp::decode_with_units(raw, UNITS_PER_SECOND).unwrap();
        prop_assert_eq!(decoded, ts);
        prop_assert_eq!(decoded.seconds(), ts.seconds());
        prop_assert_eq!(decoded.encode(), raw);
    }

    /// Elapsed and units timestamps keep their magnitude.
    #[test]
    fn test_elapsed_roundtrip_proptest(ts in elapsed_strategy()) {
        let decoded = Timestamp::decode_with_units(ts.encode(), UNITS_PER_SECOND).unwrap();
        prop_assert_eq!(decoded, ts);
        prop_assert!(decoded.time_equals(&ts));
    }

    /// Ordering agrees across resolutions.
    #[test]
    fn test_cross_scale_ordering_proptest(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000) {
        let lhs = Timestamp::from_millis(a).unwrap();
        let rhs = Timestamp::from_micros(b).unwrap();
        prop_assert_eq!(lhs.compare(&rhs), (a * 1_000).cmp(&b));
    }

    /// Resident volume stays under the threshold except for the newest item.
    #[test]
    fn test_volume_policy_bound_proptest(
        sizes in prop::collection::vec(0usize..2_000, 1..60),
        threshold in 0u64..4_000,
    ) {
        let mut cache = ItemCache::new(Box::new(VolumePolicy::new(threshold, EvictAction::Hollow)));
        let mut total = 0u64;
        for (position, size) in sizes.iter().enumerate() {
            let ts = Timestamp::from_millis(position as i64).unwrap();
            cache.add_item(IndexItem::new(ts, ts, vec![0u8; *size]), position as u64);
            total += *size as u64;
            prop_assert!(cache.data_volume() <= threshold.max(*size as u64));
            prop_assert!(cache.contains_item(position as u64) || *size == 0);
        }
        prop_assert!(cache.data_volume() <= total);
        prop_assert_eq!(cache.item_count(), sizes.len() as u64);
    }
}
