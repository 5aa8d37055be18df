//! Result thinning with LTTB (Largest Triangle Three Buckets)
//!
//! LTTB keeps the first and last point and, for every bucket in between,
//! the point forming the largest triangle with the previously kept point
//! and the average of the next bucket. It preserves the visual shape of a
//! series far better than plain averaging.

/// Reduce `points` by `factor`, keeping `len / factor` points.
///
/// Factors at or below 1 and series too short to thin are returned as is.
pub fn downsample(points: &[(i64, f64)], factor: f64) -> Vec<(i64, f64)> {
    if !factor.is_finite() || factor <= 1.0 {
        return points.to_vec();
    }
    let threshold = (points.len() as f64 / factor).floor() as usize;
    lttb(points, threshold)
}

/// LTTB over `points` down to `threshold` points
pub fn lttb(points: &[(i64, f64)], threshold: usize) -> Vec<(i64, f64)> {
    let n = points.len();
    if threshold == 0 || n <= threshold || n <= 2 {
        return points.to_vec();
    }
    if threshold <= 2 {
        return vec![points[0], points[n - 1]];
    }

    let mut sampled = Vec::with_capacity(threshold);
    sampled.push(points[0]);

    let bucket_size = (n - 2) as f64 / (threshold - 2) as f64;
    let mut a = 0;

    for i in 0..threshold - 2 {
        let bucket_start = (i as f64 * bucket_size).floor() as usize + 1;
        let bucket_end = (((i + 1) as f64 * bucket_size).floor() as usize + 1).min(n - 1);

        let next_start = bucket_end;
        let next_end = (((i + 2) as f64 * bucket_size).floor() as usize + 1).min(n);
        let (avg_x, avg_y) = if next_end > next_start {
            let next = &points[next_start..next_end];
            let count = next.len() as f64;
            (
                next.iter().map(|(t, _)| *t as f64).sum::<f64>() / count,
                next.iter().map(|(_, v)| *v).sum::<f64>() / count,
            )
        } else {
            (points[n - 1].0 as f64, points[n - 1].1)
        };

        let (a_x, a_y) = (points[a].0 as f64, points[a].1);
        let mut max_area = -1.0;
        let mut max_idx = bucket_start;
        for (j, (t, v)) in points
            .iter()
            .enumerate()
            .take(bucket_end)
            .skip(bucket_start)
        {
            let area = ((a_x - avg_x) * (v - a_y) - (a_x - *t as f64) * (avg_y - a_y)).abs();
            if area > max_area {
                max_area = area;
                max_idx = j;
            }
        }

        sampled.push(points[max_idx]);
        a = max_idx;
    }

    sampled.push(points[n - 1]);
    sampled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(n: usize) -> Vec<(i64, f64)> {
        (0..n)
            .map(|i| (i as i64 * 60_000, ((i * 7) % 5) as f64))
            .collect()
    }

    #[test]
    fn test_factor_two_halves_points() {
        let points = series(10);
        let sampled = downsample(&points, 2.0);
        assert_eq!(sampled.len(), 5);
        assert_eq!(sampled[0], points[0]);
        assert_eq!(sampled[4], points[9]);
        // every kept point comes from the input, in order
        assert!(sampled.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(sampled.iter().all(|p| points.contains(p)));
    }

    #[test]
    fn test_small_factor_is_identity() {
        let points = series(10);
        assert_eq!(downsample(&points, 1.0), points);
        assert_eq!(downsample(&points, 0.5), points);
        assert_eq!(downsample(&points, f64::NAN), points);
    }

    #[test]
    fn test_tiny_threshold_keeps_endpoints() {
        let points = series(10);
        assert_eq!(downsample(&points, 5.0), vec![points[0], points[9]]);
        assert_eq!(downsample(&points, 100.0), points);
        assert!(downsample(&[], 2.0).is_empty());
    }

    #[test]
    fn test_lttb_keeps_spike() {
        let mut points: Vec<(i64, f64)> = (0..9).map(|i| (i, 0.0)).collect();
        points[4].1 = 100.0;
        let sampled = lttb(&points, 3);
        assert_eq!(sampled, vec![(0, 0.0), (4, 100.0), (8, 0.0)]);
    }
}
