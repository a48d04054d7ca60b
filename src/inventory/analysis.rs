// src/inventory/analysis.rs
//
// Confidence scoring of tags seen while the gate was active.
//
// Two trailing windows are cut from a history snapshot:
// - slope window (2 s): RSSI is reduced to one median per wall-clock second and
//   fitted with an ordinary least-squares line; the slope measures approach
// - variance window (4 s): raw RSSI sample variance measures multipath churn
// Each is computed per (EPC, antenna) and per EPC, then blended into 0-100 scores.

use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::sensor::Direction;
use crate::protocol::TagRead;

// ============================================================================
// Configuration
// ============================================================================

/// Scoring constants. The defaults are the tuned values used at the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_slope_window_ms")]
    pub slope_window_ms: i64,
    #[serde(default = "default_variance_window_ms")]
    pub variance_window_ms: i64,
    /// Weight of the variance term; the slope term gets `1 - alpha`
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_slope_min")]
    pub slope_min: f64,
    #[serde(default = "default_slope_max")]
    pub slope_max: f64,
    #[serde(default = "default_variance_min")]
    pub variance_min: f64,
    #[serde(default = "default_variance_max")]
    pub variance_max: f64,
    /// Slopes above this are treated as artifacts and dropped
    #[serde(default = "default_slope_outlier_cap")]
    pub slope_outlier_cap: f64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// How many of the three scores must clear the threshold
    #[serde(default = "default_min_passing_scores")]
    pub min_passing_scores: usize,
}

fn default_slope_window_ms() -> i64 {
    2000
}
fn default_variance_window_ms() -> i64 {
    4000
}
fn default_alpha() -> f64 {
    0.5
}
fn default_slope_min() -> f64 {
    0.5
}
fn default_slope_max() -> f64 {
    15.0
}
fn default_variance_min() -> f64 {
    2.0
}
fn default_variance_max() -> f64 {
    40.0
}
fn default_slope_outlier_cap() -> f64 {
    30.0
}
fn default_confidence_threshold() -> f64 {
    30.0
}
fn default_min_passing_scores() -> usize {
    2
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            slope_window_ms: default_slope_window_ms(),
            variance_window_ms: default_variance_window_ms(),
            alpha: default_alpha(),
            slope_min: default_slope_min(),
            slope_max: default_slope_max(),
            variance_min: default_variance_min(),
            variance_max: default_variance_max(),
            slope_outlier_cap: default_slope_outlier_cap(),
            confidence_threshold: default_confidence_threshold(),
            min_passing_scores: default_min_passing_scores(),
        }
    }
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub epc: String,
    pub confidence_ant1: f64,
    pub confidence_ant2: f64,
    pub confidence_all: f64,
    pub direction: Direction,
}

impl AnalysisResult {
    fn best_antenna(&self) -> f64 {
        self.confidence_ant1.max(self.confidence_ant2)
    }
}

type AntennaKey = (String, u8);

// ============================================================================
// Statistics
// ============================================================================

/// Strip whitespace and hyphens, uppercase.
pub fn canonical_epc(epc: &str) -> String {
    epc.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .flat_map(char::to_uppercase)
        .collect()
}

/// One median RSSI per wall-clock second, ordered by second.
/// Even-sized seconds take the floor of the two middle values' mean.
pub fn median_rssi_per_second(reads: &[&TagRead]) -> Vec<(i64, i32)> {
    let mut by_second: BTreeMap<i64, Vec<i32>> = BTreeMap::new();
    for read in reads {
        by_second
            .entry(read.read_time.timestamp())
            .or_default()
            .push(read.rssi);
    }

    by_second
        .into_iter()
        .map(|(second, mut values)| {
            values.sort_unstable();
            let mid = values.len() / 2;
            let median = if values.len() % 2 == 1 {
                values[mid]
            } else {
                (values[mid - 1] + values[mid]).div_euclid(2)
            };
            (second, median)
        })
        .collect()
}

/// Least-squares slope of y over x. Zero when x has no spread.
pub fn regression_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    if points.len() < 2 {
        return 0.0;
    }

    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for &(x, y) in points {
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator == 0.0 {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denominator
}

/// Bessel-corrected variance. `None` below two samples.
pub fn sample_variance(values: &[i32]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
    let squares = values
        .iter()
        .map(|v| {
            let d = *v as f64 - mean;
            d * d
        })
        .sum::<f64>();
    Some(squares / (n - 1.0))
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Blend a slope and a variance into a 0-100 score.
pub fn confidence(slope: f64, variance: f64, config: &AnalysisConfig) -> f64 {
    let slope_score = clamp01((slope - config.slope_min) / (config.slope_max - config.slope_min));
    let variance_score =
        clamp01((variance - config.variance_min) / (config.variance_max - config.variance_min));
    ((1.0 - config.alpha) * slope_score + config.alpha * variance_score) * 100.0
}

/// Per-second median series turned into a slope, if there are at least two seconds.
fn series_slope(reads: &[&TagRead]) -> Option<f64> {
    let medians = median_rssi_per_second(reads);
    let (first_second, _) = *medians.first()?;
    if medians.len() < 2 {
        return None;
    }
    let points: Vec<(f64, f64)> = medians
        .iter()
        .map(|(second, rssi)| ((second - first_second) as f64, *rssi as f64))
        .collect();
    Some(regression_slope(&points))
}

fn in_window(read: &TagRead, start: DateTime<Local>, end: DateTime<Local>) -> bool {
    start <= read.read_time && read.read_time <= end
}

// ============================================================================
// Analysis
// ============================================================================

/// Score every EPC seen in the trailing windows ending at `now` and return the
/// ones that pass, best first. `direction` is attached to every result.
pub fn analyze(
    history: &[TagRead],
    now: DateTime<Local>,
    direction: Direction,
    config: &AnalysisConfig,
) -> Vec<AnalysisResult> {
    let slope_start = now - Duration::milliseconds(config.slope_window_ms);
    let variance_start = now - Duration::milliseconds(config.variance_window_ms);

    let mut slope_groups: HashMap<AntennaKey, Vec<&TagRead>> = HashMap::new();
    let mut slope_all_groups: HashMap<String, Vec<&TagRead>> = HashMap::new();
    let mut variance_groups: HashMap<AntennaKey, Vec<i32>> = HashMap::new();
    let mut variance_all_groups: HashMap<String, Vec<i32>> = HashMap::new();

    for read in history {
        let epc = canonical_epc(&read.epc);
        if in_window(read, slope_start, now) {
            slope_groups
                .entry((epc.clone(), read.antenna))
                .or_default()
                .push(read);
            slope_all_groups.entry(epc.clone()).or_default().push(read);
        }
        if in_window(read, variance_start, now) {
            variance_groups
                .entry((epc.clone(), read.antenna))
                .or_default()
                .push(read.rssi);
            variance_all_groups.entry(epc).or_default().push(read.rssi);
        }
    }

    let keep_slope = |slope: &f64| *slope <= config.slope_outlier_cap;

    let slopes: HashMap<AntennaKey, f64> = slope_groups
        .into_iter()
        .filter_map(|(key, reads)| series_slope(&reads).filter(keep_slope).map(|s| (key, s)))
        .collect();
    let slopes_all: HashMap<String, f64> = slope_all_groups
        .into_iter()
        .filter_map(|(epc, reads)| series_slope(&reads).filter(keep_slope).map(|s| (epc, s)))
        .collect();
    let variances: HashMap<AntennaKey, f64> = variance_groups
        .into_iter()
        .filter_map(|(key, values)| sample_variance(&values).map(|v| (key, v)))
        .collect();
    let variances_all: HashMap<String, f64> = variance_all_groups
        .into_iter()
        .filter_map(|(epc, values)| sample_variance(&values).map(|v| (epc, v)))
        .collect();

    let mut epcs: BTreeSet<&String> = BTreeSet::new();
    epcs.extend(slopes.keys().map(|(epc, _)| epc));
    epcs.extend(variances.keys().map(|(epc, _)| epc));
    epcs.extend(slopes_all.keys());
    epcs.extend(variances_all.keys());

    let antenna_score = |epc: &String, antenna: u8| {
        let key = (epc.clone(), antenna);
        match (slopes.get(&key), variances.get(&key)) {
            (Some(s), Some(v)) => confidence(*s, *v, config),
            _ => 0.0,
        }
    };

    let mut results: Vec<AnalysisResult> = epcs
        .into_iter()
        .filter_map(|epc| {
            let confidence_ant1 = antenna_score(epc, 1);
            let confidence_ant2 = antenna_score(epc, 2);
            let confidence_all = match (slopes_all.get(epc), variances_all.get(epc)) {
                (Some(s), Some(v)) => confidence(*s, *v, config),
                _ => 0.0,
            };

            let passing = [confidence_ant1, confidence_ant2, confidence_all]
                .iter()
                .filter(|c| **c > config.confidence_threshold)
                .count();

            (passing >= config.min_passing_scores).then(|| AnalysisResult {
                epc: epc.clone(),
                confidence_ant1,
                confidence_ant2,
                confidence_all,
                direction,
            })
        })
        .collect();

    // Descending on every key, EPC included
    results.sort_by(|a, b| {
        b.confidence_all
            .partial_cmp(&a.confidence_all)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.best_antenna()
                    .partial_cmp(&a.best_antenna())
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| b.epc.cmp(&a.epc))
    });
    results
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap()
    }

    fn at(ms: i64) -> DateTime<Local> {
        base() + Duration::milliseconds(ms)
    }

    fn read(epc: &str, antenna: u8, rssi: i32, ms: i64) -> TagRead {
        TagRead {
            epc: epc.to_string(),
            pc: "3000".to_string(),
            rssi,
            antenna,
            channel: 0,
            frequency_mhz: 865.0,
            read_time: at(ms),
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-6, "{} != {}", actual, expected);
    }

    #[test]
    fn test_canonical_epc() {
        assert_eq!(canonical_epc("e2-00 1a\t"), "E2001A");
        assert_eq!(canonical_epc("E2001A"), "E2001A");
    }

    #[test]
    fn test_median_per_second() {
        let reads = vec![
            read("A", 1, 10, 0),
            read("A", 1, 30, 100),
            read("A", 1, 20, 900),
            read("A", 1, 1, 1000),
            read("A", 1, 2, 1200),
            read("A", 1, 4, 1300),
            read("A", 1, 3, 1999),
        ];
        let refs: Vec<&TagRead> = reads.iter().collect();
        let medians = median_rssi_per_second(&refs);
        let base_second = base().timestamp();
        assert_eq!(medians, vec![(base_second, 20), (base_second + 1, 2)]);
    }

    #[test]
    fn test_median_even_floors() {
        let reads = vec![read("A", 1, -45, 0), read("A", 1, -40, 10)];
        let refs: Vec<&TagRead> = reads.iter().collect();
        assert_eq!(median_rssi_per_second(&refs)[0].1, -43);
    }

    #[test]
    fn test_regression_slope() {
        assert_close(regression_slope(&[(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)]), 2.0);
        assert_close(regression_slope(&[(0.0, -40.0), (1.0, -45.0), (2.0, -50.0)]), -5.0);
        assert_close(regression_slope(&[(1.0, 1.0), (1.0, 5.0)]), 0.0);
        assert_close(regression_slope(&[(1.0, 1.0)]), 0.0);
    }

    #[test]
    fn test_sample_variance() {
        assert_close(sample_variance(&[1, 2, 3, 4]).unwrap(), 5.0 / 3.0);
        assert_close(sample_variance(&[7, 7]).unwrap(), 0.0);
        assert!(sample_variance(&[5]).is_none());
        assert!(sample_variance(&[]).is_none());
    }

    #[test]
    fn test_confidence_monotonic_in_slope() {
        let config = AnalysisConfig::default();
        let variance = 10.0;
        let slopes = [0.5, 1.0, 3.0, 7.5, 12.0, 15.0];
        for pair in slopes.windows(2) {
            assert!(
                confidence(pair[1], variance, &config) > confidence(pair[0], variance, &config),
                "slope {} vs {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_confidence_saturates() {
        let config = AnalysisConfig::default();
        assert_close(confidence(15.0, 40.0, &config), 100.0);
        assert_close(confidence(25.0, 90.0, &config), 100.0);
        assert_close(confidence(0.0, 0.0, &config), 0.0);
        assert_close(confidence(-5.0, 1.0, &config), 0.0);
        // Slope term alone caps at half the score
        assert_close(confidence(40.0, 0.0, &config), 50.0);
    }

    #[test]
    fn test_analyze_ranks_and_filters() {
        let now = at(10_900);
        let mut history = Vec::new();

        // Strong approach on both antennas
        for antenna in [1, 2] {
            history.push(read("E2A", antenna, 100, 9_000));
            history.push(read("E2A", antenna, 110, 9_500));
            history.push(read("E2A", antenna, 120, 10_000));
            history.push(read("E2A", antenna, 130, 10_500));
        }
        // Moderate approach on antenna 1 only, written with separators
        history.push(read("e2-c", 1, 100, 9_000));
        history.push(read("E2C", 1, 104, 9_500));
        history.push(read("E2C", 1, 106, 10_000));
        history.push(read("E2C", 1, 110, 10_500));
        // Parked tag: flat signal
        for ms in [7_000, 8_000, 9_000, 10_000] {
            history.push(read("E2B", 1, 150, ms));
            history.push(read("E2B", 2, 150, ms + 100));
        }
        // Jump too steep to be real
        history.push(read("E2D", 1, 50, 9_000));
        history.push(read("E2D", 1, 200, 10_000));
        // Outside both windows
        history.push(read("E2E", 1, 100, 1_000));
        history.push(read("E2E", 1, 130, 2_000));

        let results = analyze(&history, now, Direction::In, &AnalysisConfig::default());
        let epcs: Vec<&str> = results.iter().map(|r| r.epc.as_str()).collect();
        assert_eq!(epcs, vec!["E2A", "E2C"]);

        let strong = &results[0];
        assert_close(strong.confidence_ant1, 100.0);
        assert_close(strong.confidence_ant2, 100.0);
        assert_close(strong.confidence_all, 100.0);

        // slope 6/s, variance 52/3
        let moderate = &results[1];
        let expected = 50.0 * ((6.0 - 0.5) / 14.5) + 50.0 * ((52.0 / 3.0 - 2.0) / 38.0);
        assert_close(moderate.confidence_ant1, expected);
        assert_close(moderate.confidence_ant2, 0.0);
        assert_close(moderate.confidence_all, expected);

        assert!(results.iter().all(|r| r.direction == Direction::In));
    }

    #[test]
    fn test_analyze_ties_break_on_epc_descending() {
        let now = at(10_900);
        let mut history = Vec::new();
        for epc in ["E2F1", "E2F2"] {
            history.push(read(epc, 1, 100, 9_000));
            history.push(read(epc, 1, 120, 10_000));
        }
        let results = analyze(&history, now, Direction::Out, &AnalysisConfig::default());
        let epcs: Vec<&str> = results.iter().map(|r| r.epc.as_str()).collect();
        assert_eq!(epcs, vec!["E2F2", "E2F1"]);
    }

    #[test]
    fn test_analyze_needs_two_seconds_of_slope() {
        let now = at(10_900);
        // All reads inside one second: variance exists but no slope
        let history = vec![
            read("E2G", 1, 100, 10_100),
            read("E2G", 1, 140, 10_200),
            read("E2G", 1, 100, 10_300),
        ];
        let results = analyze(&history, now, Direction::Unknown, &AnalysisConfig::default());
        assert!(results.is_empty());
    }

    #[test]
    fn test_analyze_falling_rssi_scores_variance_only() {
        let config = AnalysisConfig::default();
        let now = at(2_000);

        // Three seconds of steadily falling RSSI on antenna 1. The raw slope is
        // negative, so only the variance term (step squared) contributes.
        let score = |step: i32| {
            let history: Vec<TagRead> = (0..3)
                .map(|i| read("E2H", 1, -40 - step * i, i as i64 * 1_000))
                .collect();
            analyze(&history, now, Direction::Out, &config)
        };

        let results = score(5);
        assert_eq!(results.len(), 1);
        let expected = 50.0 * ((25.0 - 2.0) / 38.0);
        assert_close(results[0].confidence_ant1, expected);
        assert_close(results[0].confidence_ant2, 0.0);
        assert_close(results[0].confidence_all, expected);
        assert_eq!(results[0].direction, Direction::Out);

        for step in [10, 20] {
            let results = score(step);
            assert_eq!(results.len(), 1, "step {}", step);
            assert_close(results[0].confidence_all, 50.0);
            assert_close(results[0].confidence_ant1, 50.0);
        }

        // The same series rising scores on both terms
        let rising: Vec<TagRead> = (0..3)
            .map(|i| read("E2H", 1, -50 + 5 * i, i as i64 * 1_000))
            .collect();
        let results = analyze(&rising, now, Direction::In, &config);
        let expected = 50.0 * ((5.0 - 0.5) / 14.5) + 50.0 * ((25.0 - 2.0) / 38.0);
        assert_close(results[0].confidence_all, expected);
    }

    #[test]
    fn test_analyze_empty_history() {
        assert!(analyze(&[], Local::now(), Direction::Unknown, &AnalysisConfig::default()).is_empty());
    }
}
