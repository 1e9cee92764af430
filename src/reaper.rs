use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::now_ms;

/// Spawn the background maintenance tasks: the expiry sweeper and the
/// WAL compactor.
pub fn spawn(engine: &Arc<Engine>, sweep_interval: Duration, compact_threshold: u64) {
    tokio::spawn(run_sweeper(engine.clone(), sweep_interval));
    tokio::spawn(run_compactor(engine.clone(), compact_threshold));
}

/// Periodically transition overdue bookings to Expired.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.expire_overdue(now_ms()).await {
            Ok(0) => {}
            Ok(n) => info!("expired {n} overdue bookings"),
            Err(e) => tracing::warn!("expiry sweep failed: {e}"),
        }
    }
}

/// Periodically rewrite the WAL once enough records have accumulated.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let records = engine.wal_records_since_compact().await;
        if records >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("compacted WAL ({records} records folded)"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::auth::Identity;
    use crate::config::NotifyConfig;
    use crate::model::NumberStatus;
    use crate::notify::{MemorySink, Notifier};
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("numpool_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn test_notifier() -> Notifier {
        Notifier::new(
            Arc::new(MemorySink::default()),
            &NotifyConfig {
                channel: "test".into(),
                max_retries: 1,
                retry_delay: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn sweeper_expires_overdue_bookings() {
        let path = test_wal_path("sweeper_expires.wal");
        let engine = Arc::new(
            Engine::new(&path, test_notifier(), Arc::new(MemoryArchive::default()), 50).unwrap(),
        );

        // 1ms reservation window: bookings are overdue immediately
        engine.add_category(1, "flash".into(), 1).await.unwrap();
        engine.add_provider(1, "vina".into()).await.unwrap();
        engine
            .add_number(1, "0912000001", 1, 1, 100.0, 10.0, 0.0)
            .await
            .unwrap();
        engine
            .reserve_by_ids(&[1], &Identity::standard("alice"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let now = now_ms();
        assert_eq!(engine.collect_overdue(now), vec![1]);

        let expired = engine.expire_overdue(now).await.unwrap();
        assert_eq!(expired, 1);
        let number = engine.number("0912000001").await.unwrap();
        assert_eq!(number.status, NumberStatus::Expired);

        assert!(engine.collect_overdue(now_ms()).is_empty());
    }
}
