use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once `threshold` appends have accumulated. Returns whether it ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not due");
        return false;
    }
    match engine.compact().await {
        Ok(_) => true,
        Err(e) => {
            error!(error = %e, "compaction failed");
            false
        }
    }
}

/// Background task that rewrites the WAL whenever it has grown past `threshold` appends.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::HoldPolicy;
    use crate::model::*;
    use crate::wal::Wal;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("holdfast_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let clock = Arc::new(ManualClock::new(1_748_000_000_000));
        let engine = Engine::new(path.clone(), clock, HoldPolicy::default()).unwrap();
        let base = 1_748_880_000_000;
        engine
            .insert_intervals(&[Span::new(base, base + SLOT_MS)])
            .await
            .unwrap();
        let id = engine.list_bookable(engine.now_ms()).await[0].id;
        for _ in 0..3 {
            let token = engine.acquire_hold(id).await.unwrap().unwrap();
            assert!(engine.release_hold(id, &token).await.unwrap());
        }
        assert_eq!(engine.appends_since_compact().await, 7);

        assert!(!compact_if_due(&engine, 8).await);
        assert_eq!(Wal::replay(&path).unwrap().events.len(), 7);

        assert!(compact_if_due(&engine, 7).await);
        assert_eq!(engine.appends_since_compact().await, 0);
        assert_eq!(Wal::replay(&path).unwrap().events.len(), 1);
    }
}
