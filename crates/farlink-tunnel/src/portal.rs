//! TTL-evicting tunnel cache
//!
//! The [`Portal`] maps connection-target keys to live tunnels so repeated
//! calls against the same remote reuse one forwarding process. Every hit
//! refreshes an entry's TTL and its recency position, so expired entries
//! always form a contiguous prefix of the least-recently-used order and
//! the reaper can stop scanning at the first live entry.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use farlink_core::{Context, PortalConfig, TunnelConfig};

use crate::error::TunnelError;
use crate::reaper;
use crate::tunnel::Tunnel;

/// One cached tunnel with its expiry
struct Entry {
    tunnel: Arc<Tunnel>,
    expires_at: Instant,
}

/// Concurrency-safe, TTL-bounded cache of ready tunnels.
///
/// The lock guards map bookkeeping only; tunnel boot and close always
/// happen outside it, so a slow forwarding process never stalls
/// unrelated portal operations.
pub struct Portal {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
    cancel: CancellationToken,
}

impl Portal {
    /// Create a portal and start its background reaper.
    ///
    /// The reaper sweeps every `sweep_interval`; it holds only a weak
    /// handle, so dropping the portal (or calling [`Portal::shutdown`])
    /// stops it. Must be called from within a tokio runtime.
    pub fn new(config: PortalConfig) -> Arc<Self> {
        let portal = Arc::new(Self {
            entries: Mutex::new(LruCache::unbounded()),
            ttl: config.ttl(),
            cancel: CancellationToken::new(),
        });

        reaper::spawn(
            Arc::downgrade(&portal),
            config.sweep_interval,
            portal.cancel.clone(),
        );
        portal
    }

    /// Look up a tunnel, refreshing its TTL and recency on a hit
    pub fn get(&self, key: &str) -> Option<Arc<Tunnel>> {
        let mut entries = self.lock_entries();
        let entry = entries.get_mut(key)?;
        entry.expires_at = Instant::now() + self.ttl;
        Some(Arc::clone(&entry.tunnel))
    }

    /// Insert or overwrite a tunnel under a key.
    ///
    /// The new entry starts with a full TTL at the most-recently-used
    /// position. A different tunnel displaced by the overwrite is closed
    /// once the lock is released; the map never strands a live process.
    pub async fn put(&self, key: impl Into<String>, tunnel: Arc<Tunnel>) {
        let displaced = {
            let mut entries = self.lock_entries();
            entries.put(
                key.into(),
                Entry {
                    tunnel: Arc::clone(&tunnel),
                    expires_at: Instant::now() + self.ttl,
                },
            )
        };

        if let Some(old) = displaced {
            if !Arc::ptr_eq(&old.tunnel, &tunnel) {
                old.tunnel.close().await;
            }
        }
    }

    /// Remove a key and synchronously close its tunnel.
    ///
    /// Returns false if the key was not cached.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.lock_entries().pop(key);
        match removed {
            Some(entry) => {
                entry.tunnel.close().await;
                true
            }
            None => false,
        }
    }

    /// Snapshot of the cached tunnels.
    ///
    /// The snapshot is taken under the lock and yielded outside it;
    /// call again for a fresh view.
    pub fn iterate(&self) -> impl Iterator<Item = Arc<Tunnel>> {
        let snapshot: Vec<Arc<Tunnel>> = self
            .lock_entries()
            .iter()
            .map(|(_, entry)| Arc::clone(&entry.tunnel))
            .collect();
        snapshot.into_iter()
    }

    /// Number of cached tunnels
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Get a cached tunnel for the context's target, booting and caching
    /// a new one on miss.
    ///
    /// Two callers racing the same miss may both boot; the later insert
    /// wins the cache slot and the displaced tunnel is closed.
    pub async fn obtain(
        &self,
        context: &Context,
        config: &TunnelConfig,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let key = context.target_key();
        if let Some(tunnel) = self.get(&key) {
            return Ok(tunnel);
        }

        let tunnel = Arc::new(Tunnel::boot(context.clone(), config.clone()).await?);
        self.put(key, Arc::clone(&tunnel)).await;
        Ok(tunnel)
    }

    /// Evict and close every expired entry.
    ///
    /// Access always refreshes recency, so expired entries are a
    /// contiguous prefix of the LRU order: the scan stops at the first
    /// live entry instead of visiting the whole map. Eviction happens
    /// under the lock; the closes happen after it is released.
    pub async fn reap(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut entries = self.lock_entries();
            loop {
                let lru_expired = match entries.peek_lru() {
                    Some((_, entry)) => entry.expires_at <= now,
                    None => false,
                };
                if !lru_expired {
                    break;
                }
                let Some((key, entry)) = entries.pop_lru() else {
                    break;
                };
                expired.push((key, entry));
            }
        }

        if expired.is_empty() {
            return;
        }
        tracing::debug!("Reaping {} expired tunnel(s)", expired.len());
        for (key, entry) in expired {
            tracing::info!("Closing expired tunnel for {}", key);
            entry.tunnel.close().await;
        }
    }

    /// Stop the reaper and close every cached tunnel.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let drained = {
            let mut entries = self.lock_entries();
            let mut drained = Vec::with_capacity(entries.len());
            while let Some((key, entry)) = entries.pop_lru() {
                drained.push((key, entry));
            }
            drained
        };

        for (key, entry) in drained {
            tracing::debug!("Closing tunnel for {} at shutdown", key);
            entry.tunnel.close().await;
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, LruCache<String, Entry>> {
        // Bookkeeping never panics mid-update, so a poisoned lock still
        // holds a consistent map.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        // Backstop for portals dropped without shutdown(): the reaper
        // must not outlive the cache it sweeps.
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farlink_core::HostVerification;
    use std::path::PathBuf;

    fn sweep(interval: Duration) -> PortalConfig {
        PortalConfig {
            sweep_interval: interval,
        }
    }

    fn stub(tag: &str) -> Arc<Tunnel> {
        let context = Context {
            interface: "io.podman".to_string(),
            local_socket: std::env::temp_dir().join(format!("farlink-portal-{}.sock", tag)),
            remote_socket: PathBuf::from("/run/podman/io.podman"),
            username: "core".to_string(),
            hostname: format!("{}.example.net", tag),
            port: None,
            identity_file: None,
            host_verification: HostVerification::Insecure,
        };
        Arc::new(Tunnel::stub(context))
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_returns_most_recent_put() {
        let portal = Portal::new(sweep(Duration::from_secs(30)));
        let first = stub("first");
        let second = stub("second");

        portal.put("unix:/01", Arc::clone(&first)).await;
        portal.put("unix:/01", Arc::clone(&second)).await;

        let got = portal.get("unix:/01").expect("cached entry");
        assert!(Arc::ptr_eq(&got, &second));
        // Overwriting closed the tunnel it displaced
        assert!(first.is_closed());
        assert!(!second.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_misses_unknown_key() {
        let portal = Portal::new(sweep(Duration::from_secs(30)));
        assert!(portal.get("unix:/nope").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_expired_entries() {
        // 500ms sweep: entries live for 1s
        let portal = Portal::new(sweep(Duration::from_millis(500)));
        let t1 = stub("a");
        let t2 = stub("b");

        portal.put("unix:/01", Arc::clone(&t1)).await;
        portal.put("unix:/02", Arc::clone(&t2)).await;
        assert_eq!(portal.len(), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        portal.reap().await;

        assert_eq!(portal.len(), 0);
        assert!(t1.is_closed());
        assert!(t2.is_closed());

        // Closing an already-reaped tunnel again is a no-op
        t1.close().await;
        assert!(t1.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_without_expiry_keeps_entries() {
        // Effectively-disabled sweep: nothing may be evicted early
        let portal = Portal::new(sweep(Duration::from_secs(500)));
        let t1 = stub("keep-a");
        let t2 = stub("keep-b");

        portal.put("unix:/01", Arc::clone(&t1)).await;
        portal.put("unix:/02", Arc::clone(&t2)).await;
        portal.reap().await;

        assert_eq!(portal.len(), 2);
        assert!(!t1.is_closed());
        assert!(!t2.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_refresh_protects_from_reap() {
        let portal = Portal::new(sweep(Duration::from_millis(500)));
        let t1 = stub("refresh");

        portal.put("unix:/01", Arc::clone(&t1)).await;
        tokio::time::advance(Duration::from_millis(700)).await;

        // Hit at 700ms pushes expiry out to 1.7s
        assert!(portal.get("unix:/01").is_some());
        tokio::time::advance(Duration::from_millis(500)).await;
        portal.reap().await;

        assert_eq!(portal.len(), 1);
        assert!(!t1.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshed_entry_outlives_stale_sibling() {
        let portal = Portal::new(sweep(Duration::from_millis(500)));
        let hot = stub("hot");
        let cold = stub("cold");

        portal.put("unix:/hot", Arc::clone(&hot)).await;
        portal.put("unix:/cold", Arc::clone(&cold)).await;

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(portal.get("unix:/hot").is_some());

        // 1.1s in: the cold entry is past its 1s expiry, the hot one was
        // refreshed at 600ms and survives
        tokio::time::advance(Duration::from_millis(500)).await;
        portal.reap().await;

        assert_eq!(portal.len(), 1);
        assert!(cold.is_closed());
        assert!(!hot.is_closed());
        assert!(portal.get("unix:/hot").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_closes_and_removes() {
        let portal = Portal::new(sweep(Duration::from_secs(30)));
        let t1 = stub("del-a");
        let t2 = stub("del-b");

        portal.put("unix:/01", Arc::clone(&t1)).await;
        portal.put("unix:/02", Arc::clone(&t2)).await;

        assert!(portal.delete("unix:/02").await);
        assert_eq!(portal.len(), 1);
        assert!(t2.is_closed());
        assert!(portal.get("unix:/02").is_none());

        let remaining: Vec<_> = portal.iterate().collect();
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &t1));

        // Deleting a missing key reports not-found
        assert!(!portal.delete("unix:/02").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_task_sweeps_on_its_own() {
        let portal = Portal::new(sweep(Duration::from_millis(500)));
        let t1 = stub("bg");

        portal.put("unix:/01", Arc::clone(&t1)).await;

        // No manual reap: the background task must evict on schedule
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(portal.is_empty());
        assert!(t1.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        let portal = Portal::new(sweep(Duration::from_secs(30)));
        let t1 = stub("down-a");
        let t2 = stub("down-b");

        portal.put("unix:/01", Arc::clone(&t1)).await;
        portal.put("unix:/02", Arc::clone(&t2)).await;

        portal.shutdown().await;
        assert!(portal.is_empty());
        assert!(t1.is_closed());
        assert!(t2.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_access_keeps_map_consistent() {
        let portal = Portal::new(sweep(Duration::from_secs(30)));

        let mut handles = Vec::new();
        for worker in 0..4 {
            let portal = Arc::clone(&portal);
            handles.push(tokio::spawn(async move {
                for round in 0..25 {
                    let key = format!("unix:/{}", round % 5);
                    if let Some(tunnel) = portal.get(&key) {
                        assert!(!tunnel.is_closed());
                    } else {
                        let tag = format!("c{}-{}", worker, round);
                        portal.put(key, stub(&tag)).await;
                    }
                    let _ = portal.iterate().count();
                }
            }));
        }
        for handle in handles {
            handle.await.expect("worker panicked");
        }

        assert!(portal.len() <= 5);
        for tunnel in portal.iterate() {
            assert!(!tunnel.is_closed());
        }
    }
}
