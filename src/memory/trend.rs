/// Least-squares slope of `value` over `time` (seconds), scaled to units per
/// minute.
///
/// Returns 0.0 for fewer than two points or when every point shares the same
/// time.
pub fn slope(points: &[(f64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    // Shift to the first sample so large epoch timestamps don't swamp the sums
    let origin = points[0].0;
    let n = points.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for &(time, value) in points {
        let x = time - origin;
        sum_x += x;
        sum_y += value;
        sum_xy += x * value;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return 0.0;
    }

    let per_second = (n * sum_xy - sum_x * sum_y) / denominator;
    per_second * 60.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slope_scales_to_per_minute() {
        assert!((slope(&[(0.0, 0.0), (60.0, 60.0)]) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_slope_degenerate_input() {
        assert_eq!(slope(&[]), 0.0);
        assert_eq!(slope(&[(5.0, 100.0)]), 0.0);
        assert_eq!(slope(&[(5.0, 100.0), (5.0, 900.0)]), 0.0);
    }

    #[test]
    fn test_slope_with_epoch_timestamps() {
        let base = 1_760_000_000.0;
        let points: Vec<(f64, f64)> = (0..30)
            .map(|i| (base + i as f64 * 10.0, 1_000_000.0 + i as f64 * 500_000.0))
            .collect();
        // 500 KB per 10 s
        assert!((slope(&points) - 3_000_000.0).abs() < 1e-3);
    }

    #[test]
    fn test_slope_flat_series() {
        let points: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, 42.0)).collect();
        assert!(slope(&points).abs() < 1e-12);
    }
}
