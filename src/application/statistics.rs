use crate::domain::{MetricStats, Percentiles, RawFaceMatch, RetentionPoint, StatisticsBundle};

pub const HISTOGRAM_BINS: usize = 20;

/// Candidate thresholds for the cumulative retention curve.
const RETENTION_THRESHOLDS: [f64; 7] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7];

/// Documented Otsu fallbacks for degenerate distributions.
const FALLBACK_IOU: f64 = 0.30;
const FALLBACK_CENTER_DIST: f64 = 0.40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// A match passes when the value is >= the threshold (IoU).
    HigherPasses,
    /// A match passes when the value is <= the threshold (center distance).
    LowerPasses,
}

/// Pure function over the raw match list; cheap enough to run on every
/// analysis call.
pub fn compute_statistics(matches: &[RawFaceMatch]) -> StatisticsBundle {
    let ious: Vec<f64> = matches.iter().map(|m| m.iou).collect();
    let dists: Vec<f64> = matches.iter().map(|m| m.center_dist).collect();
    StatisticsBundle {
        sample_count: matches.len(),
        iou: metric_stats(&ious, Direction::HigherPasses),
        center_dist: metric_stats(&dists, Direction::LowerPasses),
    }
}

fn metric_stats(values: &[f64], direction: Direction) -> MetricStats {
    let histogram = histogram(values);
    let (suggested_threshold, fallback_used) = otsu_threshold(&histogram, direction);
    MetricStats {
        percentiles: percentiles(values),
        retention: retention(values, direction),
        histogram,
        suggested_threshold,
        fallback_used,
    }
}

/// 20 bins over [0,1], inclusive of the lower edge and exclusive of the
/// upper except the last bin, which is inclusive on both sides.
fn histogram(values: &[f64]) -> Vec<u64> {
    let mut bins = vec![0u64; HISTOGRAM_BINS];
    for &v in values {
        let idx = ((v * HISTOGRAM_BINS as f64) as usize).min(HISTOGRAM_BINS - 1);
        bins[idx] += 1;
    }
    bins
}

/// Order-statistic percentile with linear interpolation when the rank
/// index falls between samples. All fields are 0 for an empty input.
fn percentiles(values: &[f64]) -> Percentiles {
    if values.is_empty() {
        return Percentiles {
            min: 0.0,
            p5: 0.0,
            p25: 0.0,
            p50: 0.0,
            p75: 0.0,
            p95: 0.0,
            max: 0.0,
            mean: 0.0,
        };
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let at = |p: f64| -> f64 {
        let rank = p / 100.0 * (sorted.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        if lo == hi {
            sorted[lo]
        } else {
            let frac = rank - lo as f64;
            sorted[lo] * (1.0 - frac) + sorted[hi] * frac
        }
    };
    Percentiles {
        min: sorted[0],
        p5: at(5.0),
        p25: at(25.0),
        p50: at(50.0),
        p75: at(75.0),
        p95: at(95.0),
        max: sorted[sorted.len() - 1],
        mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
    }
}

fn retention(values: &[f64], direction: Direction) -> Vec<RetentionPoint> {
    RETENTION_THRESHOLDS
        .iter()
        .map(|&t| {
            let passing = values
                .iter()
                .filter(|&&v| match direction {
                    Direction::HigherPasses => v >= t,
                    Direction::LowerPasses => v <= t,
                })
                .count();
            let pass_pct = if values.is_empty() {
                0.0
            } else {
                passing as f64 * 100.0 / values.len() as f64
            };
            RetentionPoint { threshold: t, pass_pct }
        })
        .collect()
}

/// Otsu's method over the 20-bin histogram: picks the split that maximises
/// between-class variance. Returns the upper edge of the lower class as
/// the suggested threshold. Distributions with fewer than two nonzero
/// bins get the documented fallback instead.
fn otsu_threshold(histogram: &[u64], direction: Direction) -> (f64, bool) {
    let fallback = match direction {
        Direction::HigherPasses => FALLBACK_IOU,
        Direction::LowerPasses => FALLBACK_CENTER_DIST,
    };
    let nonzero = histogram.iter().filter(|&&c| c > 0).count();
    if nonzero < 2 {
        return (fallback, true);
    }

    let total: u64 = histogram.iter().sum();
    let bin_width = 1.0 / HISTOGRAM_BINS as f64;
    // Bin centers weight the class means.
    let total_weighted: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &c)| (i as f64 + 0.5) * bin_width * c as f64)
        .sum();

    let mut best_variance = -1.0;
    let mut best_split = 0usize;
    let mut count_lo = 0f64;
    let mut sum_lo = 0f64;
    for split in 0..HISTOGRAM_BINS - 1 {
        count_lo += histogram[split] as f64;
        sum_lo += (split as f64 + 0.5) * bin_width * histogram[split] as f64;
        let count_hi = total as f64 - count_lo;
        if count_lo == 0.0 || count_hi == 0.0 {
            continue;
        }
        let mean_lo = sum_lo / count_lo;
        let mean_hi = (total_weighted - sum_lo) / count_hi;
        let variance = count_lo * count_hi * (mean_lo - mean_hi).powi(2);
        if variance > best_variance {
            best_variance = variance;
            best_split = split;
        }
    }
    if best_variance < 0.0 {
        return (fallback, true);
    }
    ((best_split + 1) as f64 * bin_width, false)
}
