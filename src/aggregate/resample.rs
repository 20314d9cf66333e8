//! Sample merging and fixed-cadence resampling
//!
//! Shards are fed oldest window first. The first sample seen for a timestamp
//! wins; later duplicates from overlapping shards are dropped.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use crate::shard::Sample;

/// Timestamp-ordered, deduplicated set of samples
#[derive(Debug, Default)]
pub struct SampleMerger {
    by_time: BTreeMap<DateTime<Utc>, Sample>,
    duplicates: usize,
}

impl SampleMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one shard's samples, returns how many were new
    pub fn add_shard(&mut self, samples: Vec<Sample>, source: &str) -> usize {
        let mut added = 0;
        for sample in samples {
            match self.by_time.entry(sample.timestamp) {
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(sample);
                    added += 1;
                }
                std::collections::btree_map::Entry::Occupied(_) => {
                    self.duplicates += 1;
                }
            }
        }
        debug!("Merged {} new samples from {}", added, source);
        added
    }

    pub fn len(&self) -> usize {
        self.by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_time.is_empty()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Samples in strictly increasing timestamp order
    pub fn into_samples(self) -> Vec<Sample> {
        self.by_time.into_values().collect()
    }
}

/// One non-empty cadence bucket
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    /// Bucket start
    pub time: DateTime<Utc>,
    /// Last sample price in the bucket
    pub price: f64,
    /// Mean spread_pct over the bucket
    pub spread_pct: f64,
    pub samples: usize,
}

/// Resample ordered samples into fixed-cadence buckets.
///
/// Bucket index is `floor(unix_seconds / cadence)`. Empty buckets produce no
/// point, so gaps stay visible as gaps.
pub fn resample(samples: &[Sample], cadence_seconds: i64) -> Vec<Bucket> {
    let cadence = cadence_seconds.max(1);
    let mut buckets: Vec<Bucket> = Vec::new();
    let mut current: Option<(i64, f64, f64, usize)> = None;

    for sample in samples {
        let index = sample.timestamp.timestamp().div_euclid(cadence);
        match current.as_mut() {
            Some((idx, price, sum, count)) if *idx == index => {
                *price = sample.price;
                *sum += sample.spread_pct;
                *count += 1;
            }
            _ => {
                if let Some(done) = current.take() {
                    buckets.extend(close_bucket(done, cadence));
                }
                current = Some((index, sample.price, sample.spread_pct, 1));
            }
        }
    }
    if let Some(done) = current {
        buckets.extend(close_bucket(done, cadence));
    }
    buckets
}

fn close_bucket((index, price, sum, count): (i64, f64, f64, usize), cadence: i64) -> Option<Bucket> {
    let time = Utc.timestamp_opt(index * cadence, 0).single()?;
    Some(Bucket {
        time,
        price,
        spread_pct: sum / count as f64,
        samples: count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(secs: i64, price: f64, spread_pct: f64) -> Sample {
        Sample {
            timestamp: Utc.timestamp_opt(1_752_148_800 + secs, 0).unwrap(),
            price,
            bid: price - 0.5,
            ask: price + 0.5,
            spread: 1.0,
            volume: 1.0,
            spread_pct,
        }
    }

    #[test]
    fn test_merger_keeps_first_duplicate() {
        let mut merger = SampleMerger::new();
        assert_eq!(merger.add_shard(vec![sample(0, 1.0, 0.1), sample(1, 2.0, 0.1)], "a"), 2);
        assert_eq!(merger.add_shard(vec![sample(1, 99.0, 0.9), sample(2, 3.0, 0.1)], "b"), 1);

        assert_eq!(merger.duplicates(), 1);
        let samples = merger.into_samples();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[1].price, 2.0);
    }

    #[test]
    fn test_merger_orders_out_of_order_input() {
        let mut merger = SampleMerger::new();
        merger.add_shard(vec![sample(30, 3.0, 0.1), sample(10, 1.0, 0.1)], "late");
        merger.add_shard(vec![sample(20, 2.0, 0.1)], "early");
        let prices: Vec<f64> = merger.into_samples().iter().map(|s| s.price).collect();
        assert_eq!(prices, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_resample_last_price_mean_spread() {
        let samples = vec![
            sample(0, 100.0, 0.10),
            sample(20, 101.0, 0.20),
            sample(59, 102.0, 0.30),
            sample(60, 103.0, 0.40),
        ];
        let buckets = resample(&samples, 60);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].price, 102.0);
        assert!((buckets[0].spread_pct - 0.20).abs() < 1e-12);
        assert_eq!(buckets[0].samples, 3);
        assert_eq!(buckets[1].price, 103.0);
        assert_eq!(buckets[1].time.timestamp() - buckets[0].time.timestamp(), 60);
    }

    #[test]
    fn test_resample_leaves_gaps_empty() {
        let samples = vec![sample(0, 1.0, 0.1), sample(600, 2.0, 0.2)];
        let buckets = resample(&samples, 60);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[1].time.timestamp() - buckets[0].time.timestamp(), 600);
    }

    #[test]
    fn test_resample_empty() {
        assert!(resample(&[], 60).is_empty());
    }
}
