//! Latest-result cache shared by the scheduler and the metrics endpoint.

use crate::probe::{MeasurementResult, TargetKey};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Most recent measurement per target, last write wins.
///
/// Results are stored behind `Arc` and swapped whole, so a reader never sees
/// a partially written result. tokio's `RwLock` is fair, which keeps a steady
/// stream of scrapes from starving the scheduler's writes and vice versa.
#[derive(Debug, Default)]
pub struct ResultCache {
    storage: RwLock<HashMap<TargetKey, Arc<MeasurementResult>>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored result for `target`.
    pub async fn update(&self, target: TargetKey, result: MeasurementResult) {
        let result = Arc::new(result);
        let mut storage = self.storage.write().await;
        storage.insert(target, result);
    }

    /// Snapshot of every stored result, one per target, in no particular order.
    pub async fn gather(&self) -> Vec<Arc<MeasurementResult>> {
        let storage = self.storage.read().await;
        storage.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.storage.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{TargetSpec, ThroughputStats};
    use std::time::Duration;

    fn result_for(host: &str, bytes: f64) -> MeasurementResult {
        let stats = ThroughputStats {
            sent_bytes: bytes,
            received_bytes: bytes,
            sent_seconds: bytes,
            ..Default::default()
        };
        MeasurementResult::success(TargetSpec::new(host).key(), stats, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = ResultCache::new();

        for (host, bytes) in [("a", 1.0), ("b", 2.0), ("a", 3.0), ("c", 4.0), ("b", 5.0)] {
            cache
                .update(TargetSpec::new(host).key(), result_for(host, bytes))
                .await;
        }

        let mut gathered: Vec<(String, f64)> = cache
            .gather()
            .await
            .iter()
            .map(|r| (r.target.host.clone(), r.stats.as_ref().unwrap().sent_bytes))
            .collect();
        gathered.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(
            gathered,
            vec![
                ("a".to_string(), 3.0),
                ("b".to_string(), 5.0),
                ("c".to_string(), 4.0)
            ]
        );

        // Gathering again yields the same snapshot.
        assert_eq!(cache.gather().await.len(), 3);
        assert_eq!(cache.len().await, 3);
    }

    #[tokio::test]
    async fn test_failure_replaces_success() {
        let cache = ResultCache::new();
        let key = TargetSpec::new("down.example.com").key();

        cache.update(key.clone(), result_for("down.example.com", 1.0)).await;
        cache
            .update(
                key.clone(),
                MeasurementResult::failure(key, "connection refused", Duration::ZERO),
            )
            .await;

        let gathered = cache.gather().await;
        assert_eq!(gathered.len(), 1);
        assert!(!gathered[0].is_success());
        assert_eq!(gathered[0].error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_empty_gather() {
        let cache = ResultCache::new();
        assert!(cache.gather().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_update_and_gather() {
        let cache = Arc::new(ResultCache::new());
        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        let mut handles = Vec::new();

        for writer in 0..4 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let host = format!("target-{}", writer % 2);
                let mut seq = 0.0;
                while tokio::time::Instant::now() < deadline {
                    seq += 1.0;
                    cache
                        .update(TargetSpec::new(&host).key(), result_for(&host, seq))
                        .await;
                    tokio::task::yield_now().await;
                }
            }));
        }

        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                while tokio::time::Instant::now() < deadline {
                    for result in cache.gather().await {
                        let stats = result.stats.as_ref().unwrap();
                        assert_eq!(stats.sent_bytes, stats.received_bytes);
                        assert_eq!(stats.sent_bytes, stats.sent_seconds);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            for handle in handles {
                handle.await.unwrap();
            }
        })
        .await;
        assert!(joined.is_ok(), "cache readers/writers deadlocked");
        assert!(cache.gather().await.len() <= 2);
    }
}
