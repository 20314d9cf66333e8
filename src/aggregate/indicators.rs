//! Rolling spread indicators

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};

use super::resample::Bucket;

/// Simple moving average of spread_pct over one window
#[derive(Debug, Clone, PartialEq)]
pub struct MovingAverage {
    pub window: usize,
    pub value: f64,
    /// At least `window` points back this value
    pub valid: bool,
}

/// One output row of the historical series
#[derive(Debug, Clone, PartialEq)]
pub struct ResampledPoint {
    pub time: DateTime<Utc>,
    pub price: f64,
    pub spread_pct: f64,
    pub averages: Vec<MovingAverage>,
}

impl ResampledPoint {
    pub fn average(&self, window: usize) -> Option<&MovingAverage> {
        self.averages.iter().find(|ma| ma.window == window)
    }
}

/// Flat record layout: `time, price, spread_pct, ma_N, ma_N_valid, ...`
impl Serialize for ResampledPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3 + self.averages.len() * 2))?;
        map.serialize_entry("time", &format_time(&self.time))?;
        map.serialize_entry("price", &self.price)?;
        map.serialize_entry("spread_pct", &self.spread_pct)?;
        for ma in &self.averages {
            map.serialize_entry(&format!("ma_{}", ma.window), &ma.value)?;
            map.serialize_entry(&format!("ma_{}_valid", ma.window), &ma.valid)?;
        }
        map.end()
    }
}

pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Attach a moving average per window to each bucket.
///
/// Fewer than N points still yield an average of what is available; the
/// validity flag is set from the point's position in the whole series, so it
/// turns on at the N-th point and stays on.
pub fn annotate(buckets: Vec<Bucket>, windows: &[usize]) -> Vec<ResampledPoint> {
    let spreads: Vec<f64> = buckets.iter().map(|b| b.spread_pct).collect();
    let mut sums = vec![0.0f64; windows.len()];

    buckets
        .into_iter()
        .enumerate()
        .map(|(i, bucket)| {
            let averages = windows
                .iter()
                .zip(sums.iter_mut())
                .map(|(&window, sum)| {
                    *sum += spreads[i];
                    if i >= window {
                        *sum -= spreads[i - window];
                    }
                    let count = (i + 1).min(window);
                    MovingAverage {
                        window,
                        value: *sum / count as f64,
                        valid: i + 1 >= window,
                    }
                })
                .collect();

            ResampledPoint {
                time: bucket.time,
                price: bucket.price,
                spread_pct: bucket.spread_pct,
                averages,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn buckets(spreads: &[f64]) -> Vec<Bucket> {
        spreads
            .iter()
            .enumerate()
            .map(|(i, s)| Bucket {
                time: Utc.timestamp_opt(1_752_148_800 + i as i64 * 60, 0).unwrap(),
                price: 100.0 + i as f64,
                spread_pct: *s,
                samples: 1,
            })
            .collect()
    }

    #[test]
    fn test_sma_values_and_partial_windows() {
        let points = annotate(buckets(&[1.0, 2.0, 3.0, 4.0]), &[2, 3]);

        let ma2: Vec<f64> = points.iter().map(|p| p.average(2).unwrap().value).collect();
        assert_eq!(ma2, vec![1.0, 1.5, 2.5, 3.5]);

        let ma3: Vec<f64> = points.iter().map(|p| p.average(3).unwrap().value).collect();
        assert_eq!(ma3, vec![1.0, 1.5, 2.0, 3.0]);
    }

    #[test]
    fn test_validity_starts_at_nth_point_and_stays() {
        let points = annotate(buckets(&[0.1; 10]), &[4]);
        let flags: Vec<bool> = points.iter().map(|p| p.averages[0].valid).collect();
        assert_eq!(
            flags,
            vec![false, false, false, true, true, true, true, true, true, true]
        );
    }

    #[test]
    fn test_point_serializes_flat() {
        let points = annotate(buckets(&[0.5]), &[50]);
        let value = serde_json::to_value(&points[0]).unwrap();
        assert_eq!(value["time"], "2025-07-10T12:00:00.000Z");
        assert_eq!(value["price"], 100.0);
        assert_eq!(value["ma_50"], 0.5);
        assert_eq!(value["ma_50_valid"], false);
    }
}
