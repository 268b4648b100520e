use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Background task that rewrites a tenant's WAL as a snapshot once enough
/// appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!("compaction failed: {e}");
        }
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_needed(
    engine: &Engine,
    threshold: u64,
) -> Result<bool, crate::engine::EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("{appends} WAL appends since compaction, below {threshold}");
        return Ok(false);
    }
    engine.compact_wal().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Engine::new(path.clone(), notify).unwrap();

        for _ in 0..3 {
            engine.register_vehicle(Ulid::new(), None).await.unwrap();
        }
        assert!(!compact_if_needed(&engine, 5).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 3);

        for _ in 0..2 {
            engine.register_driver(Ulid::new(), None).await.unwrap();
        }
        assert!(compact_if_needed(&engine, 5).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        drop(engine);
        let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
        let all = engine.list_resources(None).await.unwrap();
        assert_eq!(all.len(), 5);
        let drivers = engine.list_resources(Some(ResourceKind::Driver)).await.unwrap();
        assert_eq!(drivers.len(), 2);
    }
}
