//! Periodic deletion of expired records.

use crate::config::Config;
use crate::error::Result;
use crate::extractor::Action;
use crate::nsupdate::{RecordRequest, SessionSettings};
use crate::pipeline::run_batch;
use crate::store::{ExpiryRecord, ExpiryStore};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Remove one expired record from the nameserver, then from the store.
///
/// The session authenticates with the record's zone only; credentials, if
/// the nameserver needs them, come from the configured program arguments.
pub async fn delete_expired(
    settings: SessionSettings,
    store: &dyn ExpiryStore,
    record: &ExpiryRecord,
) -> Result<()> {
    let req = RecordRequest {
        domain: record.name.clone(),
        fqdn: record.name.clone(),
        zone: record.zone.clone(),
        key_name: String::new(),
        secret: String::new(),
        record_type: record.record_type,
        value: String::new(),
        action: Action::Delete,
    };
    run_batch(settings, &[req]).await?;
    store.delete(&record.key()).await
}

/// Deletion tasks currently running, keyed by record.
#[derive(Default)]
pub struct InFlight {
    tasks: JoinSet<Result<()>>,
    ids: HashMap<task::Id, String>,
    keys: HashSet<String>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn spawn<F>(&mut self, key: String, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.tasks.spawn(task).id();
        self.ids.insert(id, key.clone());
        self.keys.insert(key);
    }

    fn finish(&mut self, joined: std::result::Result<(task::Id, Result<()>), JoinError>) {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, Some(outcome)),
            Err(e) => {
                error!("Expiry deletion task failed: {}", e);
                (e.id(), None)
            }
        };
        let Some(key) = self.ids.remove(&id) else {
            return;
        };
        match outcome {
            Some(Ok(())) => info!("Deleted expired record {}", key),
            Some(Err(e)) => warn!("Failed to delete expired record {}: {}", key, e),
            None => {}
        }
        self.keys.remove(&key);
    }

    /// Collect tasks that already finished.
    pub fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            self.finish(joined);
        }
    }

    /// Wait for every running task.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.finish(joined);
        }
    }
}

/// Background sweeper over an [`ExpiryStore`].
pub struct Sweeper {
    settings: SessionSettings,
    store: Arc<dyn ExpiryStore>,
    interval: Duration,
    max_in_flight: usize,
}

impl Sweeper {
    pub fn new(config: &Config, store: Arc<dyn ExpiryStore>) -> Self {
        Self {
            settings: SessionSettings::from_config(config),
            store,
            interval: Duration::from_secs(config.expiry.sweep_interval_secs),
            max_in_flight: config.expiry.max_in_flight.max(1),
        }
    }

    /// Start deletions for expired records not already in flight.
    ///
    /// Never blocks on the deletions themselves.
    pub async fn sweep(&self, in_flight: &mut InFlight) {
        in_flight.reap();

        let records = match self.store.list().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Expiry sweep could not read the store: {}", e);
                return;
            }
        };

        let now = Utc::now();
        for record in records.into_iter().filter(|r| r.is_expired(now)) {
            let key = record.key();
            if in_flight.contains(&key) {
                continue;
            }
            if in_flight.len() >= self.max_in_flight {
                debug!("Expiry sweep at capacity, {} left for next tick", key);
                break;
            }

            info!("Expired {} record {}, deleting", record.record_type, record.name);
            let settings = self.settings.clone();
            let store = Arc::clone(&self.store);
            in_flight.spawn(key, async move {
                delete_expired(settings, store.as_ref(), &record).await
            });
        }
    }

    /// Sweep every interval until `shutdown` turns true, then wait for the
    /// deletions still running.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight = InFlight::new();

        info!("Expiry sweeper running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(&mut in_flight).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!("Waiting for {} expiry deletions", in_flight.len());
        }
        in_flight.drain().await;
        info!("Expiry sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::RecordType;
    use crate::store::MemoryExpiryStore;
    use chrono::Duration as ChronoDuration;

    fn config(script: &str) -> Config {
        Config {
            nsupdate_binary: "sh".to_string(),
            nsupdate_args: vec!["-c".to_string(), script.to_string()],
            ..Config::default()
        }
    }

    fn record(name: &str, expires_in: i64) -> ExpiryRecord {
        let now = Utc::now();
        ExpiryRecord {
            name: name.to_string(),
            zone: "example.org".to_string(),
            record_type: RecordType::A,
            value: "1.2.3.4".to_string(),
            ttl: 300,
            created: now,
            expiry: now + ChronoDuration::seconds(expires_in),
        }
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired() {
        let store = MemoryExpiryStore::new();
        store.put(record("old.example.org", -10)).await.unwrap();
        store.put(record("new.example.org", 3600)).await.unwrap();

        let sweeper = Sweeper::new(&config("cat > /dev/null"), Arc::new(store.clone()));
        let mut in_flight = InFlight::new();
        sweeper.sweep(&mut in_flight).await;
        assert_eq!(in_flight.len(), 1);
        in_flight.drain().await;

        let left: Vec<String> = store.list().await.unwrap().iter().map(|r| r.name.clone()).collect();
        assert_eq!(left, vec!["new.example.org"]);
    }

    #[tokio::test]
    async fn test_failed_deletion_keeps_record_for_retry() {
        let store = MemoryExpiryStore::new();
        store.put(record("old.example.org", -10)).await.unwrap();

        let sweeper = Sweeper::new(
            &config("cat > /dev/null; echo REFUSED >&2; exit 1"),
            Arc::new(store.clone()),
        );
        let mut in_flight = InFlight::new();
        sweeper.sweep(&mut in_flight).await;
        in_flight.drain().await;

        assert_eq!(store.len().await, 1);
        assert!(in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_is_bounded_and_deduplicated() {
        let store = MemoryExpiryStore::new();
        for i in 0..5 {
            store.put(record(&format!("h{}.example.org", i), -10)).await.unwrap();
        }

        let mut cfg = config("cat > /dev/null; sleep 1");
        cfg.expiry.max_in_flight = 2;
        let sweeper = Sweeper::new(&cfg, Arc::new(store.clone()));

        let mut in_flight = InFlight::new();
        sweeper.sweep(&mut in_flight).await;
        assert_eq!(in_flight.len(), 2);
        sweeper.sweep(&mut in_flight).await;
        assert_eq!(in_flight.len(), 2);

        in_flight.drain().await;
        assert_eq!(store.len().await, 3);
    }

    async fn exploding() -> Result<()> {
        panic!("deletion blew up")
    }

    #[tokio::test]
    async fn test_panicked_deletion_frees_its_slot() {
        let mut in_flight = InFlight::new();
        in_flight.spawn("old.example.org/A".to_string(), exploding());
        in_flight.spawn("other.example.org/A".to_string(), std::future::ready(Ok(())));
        assert_eq!(in_flight.len(), 2);

        in_flight.drain().await;
        assert!(in_flight.is_empty());
        assert!(!in_flight.contains("old.example.org/A"));
        assert!(in_flight.ids.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_deletions() {
        let store = MemoryExpiryStore::new();
        store.put(record("old.example.org", -10)).await.unwrap();

        let sweeper = Sweeper::new(&config("cat > /dev/null; sleep 1"), Arc::new(store.clone()));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sweeper.run(rx));

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(store.is_empty().await);
    }
}
