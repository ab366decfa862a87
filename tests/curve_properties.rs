use kids_guard::curve::{BrightnessCurve, BrightnessRange, NativeScale, clamp_percent};
use kids_guard::target::TargetKind;
use proptest::prelude::*;

fn curve_strategy() -> impl Strategy<Value = BrightnessCurve> {
    prop_oneof![
        Just(BrightnessCurve::Linear),
        Just(BrightnessCurve::Quadratic),
        Just(BrightnessCurve::Perceptual),
        Just(BrightnessCurve::RemappedPerceptual),
    ]
}

/// Any valid device range, from coarse 15-step volume up to 16-bit backlights
fn range_strategy() -> impl Strategy<Value = BrightnessRange> {
    (0u32..1000, 1u32..65_536).prop_map(|(minimum, span)| {
        BrightnessRange::new(minimum, minimum + span).unwrap_or_default()
    })
}

/// Ranges fine enough that the bottom of the steep curves does not collapse
fn fine_range_strategy() -> impl Strategy<Value = BrightnessRange> {
    (0u32..100, 19_393u32..65_536).prop_map(|(minimum, span)| {
        BrightnessRange::new(minimum, minimum + span).unwrap_or_default()
    })
}

proptest! {
    #[test]
    fn native_value_stays_in_range(
        curve in curve_strategy(),
        range in range_strategy(),
        percent in any::<i32>(),
    ) {
        let native = NativeScale::new(curve, range).percent_to_native(percent);
        prop_assert!(native >= range.minimum());
        prop_assert!(native <= range.maximum());
    }

    #[test]
    fn percent_is_always_a_percentage(
        curve in curve_strategy(),
        range in range_strategy(),
        native in any::<i64>(),
    ) {
        let percent = NativeScale::new(curve, range).native_to_percent(native);
        prop_assert!(percent <= 100);
    }

    #[test]
    fn conversion_is_monotonic(
        curve in curve_strategy(),
        range in range_strategy(),
        a in 0i32..=100,
        b in 0i32..=100,
    ) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let scale = NativeScale::new(curve, range);
        prop_assert!(scale.percent_to_native(low) <= scale.percent_to_native(high));
    }

    #[test]
    fn endpoints_map_to_range_bounds(curve in curve_strategy(), range in range_strategy()) {
        let scale = NativeScale::new(curve, range);
        prop_assert_eq!(scale.percent_to_native(0), range.minimum());
        prop_assert_eq!(scale.percent_to_native(100), range.maximum());
        prop_assert_eq!(scale.percent_to_native(-40), range.minimum());
        prop_assert_eq!(scale.percent_to_native(400), range.maximum());
    }

    #[test]
    fn round_trip_on_fine_ranges(
        curve in curve_strategy(),
        range in fine_range_strategy(),
        percent in 0i32..=100,
    ) {
        let scale = NativeScale::new(curve, range);
        let back = scale.native_to_percent(scale.percent_to_native(percent) as i64) as i32;
        prop_assert!((back - percent).abs() <= 1, "{}: {} -> {}", curve, percent, back);
    }

    #[test]
    fn level_path_round_trip(curve in curve_strategy(), percent in 0i32..=100) {
        let back = curve.level_to_percent(curve.percent_to_level(percent)) as i32;
        prop_assert!((back - percent).abs() <= 1);
    }

    #[test]
    fn clamping_is_idempotent(value in any::<i32>()) {
        let once = clamp_percent(value);
        prop_assert!(once <= 100);
        prop_assert_eq!(clamp_percent(once as i32), once);
    }

    #[test]
    fn target_values_stay_in_domain(value in any::<i64>()) {
        let brightness = TargetKind::Brightness.clamp(value);
        prop_assert!((0..=100).contains(&brightness));
        prop_assert!(TargetKind::ScreenTime.clamp(value) >= 0);
    }
}
