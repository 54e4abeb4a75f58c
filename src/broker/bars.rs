//! Rolling intraday bar series built from 5-second real-time bars

use super::{Bar, BarSize, BarUpdate};
use chrono::{DateTime, Duration, Utc};

/// Folds real-time bars into fixed buckets on top of a historical seed
#[derive(Debug, Clone)]
pub struct BarAggregator {
    bucket_secs: i64,
    bars: Vec<Bar>,
}

fn bucket_start(ts: DateTime<Utc>, bucket_secs: i64) -> DateTime<Utc> {
    let offset = ts.timestamp().rem_euclid(bucket_secs);
    ts - Duration::seconds(offset) - Duration::nanoseconds(ts.timestamp_subsec_nanos() as i64)
}

impl BarAggregator {
    pub fn new(bar_size: BarSize, seed: Vec<Bar>) -> Self {
        Self {
            bucket_secs: bar_size.seconds(),
            bars: seed,
        }
    }

    /// Fold one real-time bar. Returns true when it opened a new bucket.
    pub fn update(&mut self, rt: &Bar) -> bool {
        let bucket = bucket_start(rt.timestamp, self.bucket_secs);

        match self.bars.last_mut() {
            Some(current) if current.timestamp == bucket => {
                let volume = current.volume + rt.volume;
                if volume > 0.0 {
                    current.average = (current.average * current.volume + rt.average * rt.volume) / volume;
                }
                current.high = current.high.max(rt.high);
                current.low = current.low.min(rt.low);
                current.close = rt.close;
                current.volume = volume;
                false
            }
            // Late bar for a bucket already closed
            Some(current) if current.timestamp > bucket => false,
            _ => {
                self.bars.push(Bar {
                    timestamp: bucket,
                    ..rt.clone()
                });
                true
            }
        }
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn to_update(&self, has_new_bar: bool) -> BarUpdate {
        BarUpdate {
            bars: self.bars.clone(),
            has_new_bar,
        }
    }
}
