//! Per-stage timing for query requests.
//!
//! A request has two stages: the index lookup (`query`) and the byte-range
//! record fetch (`fetch`). Both durations are reported in milliseconds on
//! every response, including failed ones.

use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub query_ms: f64,
    pub fetch_ms: f64,
}

impl Profile {
    pub fn record_query(&mut self, elapsed: Duration) {
        self.query_ms += millis(elapsed);
    }

    pub fn record_fetch(&mut self, elapsed: Duration) {
        self.fetch_ms += millis(elapsed);
    }
}

/// Run a future and return its output along with how long it took.
pub async fn timed<F, T>(fut: F) -> (T, Duration)
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    let output = fut.await;
    (output, started.elapsed())
}

pub fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

/// Wall clock time in milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timed_measures_future() {
        let (value, elapsed) = timed(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            7
        })
        .await;
        assert_eq!(value, 7);
        assert!(elapsed >= Duration::from_millis(20));
    }

    #[test]
    fn test_profile_accumulates_stages_independently() {
        let mut profile = Profile::default();
        profile.record_query(Duration::from_millis(3));
        profile.record_fetch(Duration::from_millis(10));
        profile.record_query(Duration::from_millis(2));
        assert!((profile.query_ms - 5.0).abs() < 1e-6);
        assert!((profile.fetch_ms - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_profile_serializes_camel_case() {
        let json = serde_json::to_value(Profile {
            query_ms: 1.0,
            fetch_ms: 2.0,
        })
        .unwrap();
        assert_eq!(json["queryMs"], 1.0);
        assert_eq!(json["fetchMs"], 2.0);
    }
}
