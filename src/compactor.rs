use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// Returns true when a compaction ran and succeeded.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
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
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EventDraft;
    use crate::gate::InMemoryRelationships;
    use crate::ledger::InMemoryLedger;
    use crate::model::*;
    use std::path::PathBuf;

    const T0: Ms = 1_717_232_400_000; // 2024-06-01T09:00:00Z
    const H: Ms = 3_600_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fitslot_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(path: PathBuf) -> Engine {
        Engine::new(
            path,
            Arc::new(InMemoryRelationships::new()),
            Arc::new(InMemoryLedger::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn compacts_past_threshold_and_keeps_state() {
        let path = test_wal_path("threshold.wal");
        let trainer = ulid::Ulid::new();
        let actor = Actor::trainer(trainer);
        {
            let engine = engine(path.clone());
            for i in 0..4 {
                let span = Span::new(T0 + i * 2 * H, T0 + i * 2 * H + H);
                engine
                    .create_event(actor, EventDraft::new(span, EventType::Availability))
                    .await
                    .unwrap();
            }
            assert!(!compact_if_needed(&engine, 10).await);
            assert!(compact_if_needed(&engine, 4).await);
            assert_eq!(engine.wal_appends_since_compact().await, 0);
        }

        let engine = engine(path);
        let cal = engine.get_calendar(&trainer).unwrap();
        assert_eq!(cal.read().await.events.len(), 4);
    }
}
