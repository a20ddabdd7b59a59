use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

const COMPACT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a tenant's WAL once enough appends have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_POLL_INTERVAL);
    loop {
        interval.tick().await;
        maybe_compact(&engine, threshold).await;
    }
}

async fn maybe_compact(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            tracing::warn!("compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::{NaiveTime, TimeZone, Utc, Weekday};
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let notify = Arc::new(NotifyHub::new());
        let clock = Arc::new(crate::clock::FixedClock::new(
            Utc.with_ymd_and_hms(2025, 11, 15, 8, 0, 0).unwrap(),
        ));
        let engine = Arc::new(Engine::with_clock(path, notify, clock).unwrap());

        let org = Ulid::new();
        let policy = AvailabilityPolicy {
            timezone: chrono_tz::UTC,
            working_hours: vec![WorkingHours {
                weekday: Weekday::Mon,
                start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            }],
            meeting_duration: 30,
            buffer_before: 0,
            buffer_after: 0,
            minimum_notice: 0,
            blackout_dates: BTreeSet::new(),
        };
        engine.configure_policy(org, policy).await.unwrap();

        // One append so far, threshold not reached
        assert!(!maybe_compact(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 1);

        // Threshold 1 triggers a rewrite and resets the counter
        assert!(maybe_compact(&engine, 1).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
