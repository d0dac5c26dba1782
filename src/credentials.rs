use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use tokio::{sync::Mutex, time::Instant};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct Credential {
    pub key: String,
    pub label: String,
}

/// API credentials of one marketplace client, each with its own request
/// allowance. Shared by every worker of that client.
pub struct CredentialPool {
    credentials: Vec<Credential>,
    exhausted: Vec<AtomicBool>,
    rotation: AtomicUsize,
    limiter: TokenBuckets,
}

impl CredentialPool {
    /// `interval` is the minimum spacing between two calls on one credential.
    pub fn new(keys: Vec<String>, interval: Duration) -> Self {
        let credentials: Vec<Credential> = keys
            .into_iter()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .enumerate()
            .map(|(idx, key)| Credential {
                key,
                label: format!("cred-{:02}", idx + 1),
            })
            .collect();
        let exhausted = credentials.iter().map(|_| AtomicBool::new(false)).collect();
        info!(
            target = "harvester.fetch",
            credential_count = credentials.len(),
            interval_ms = interval.as_millis() as u64,
            "credential_pool_ready"
        );
        Self {
            credentials,
            exhausted,
            rotation: AtomicUsize::new(0),
            limiter: TokenBuckets::per_interval(interval),
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Credential> {
        self.credentials.get(idx)
    }

    pub fn available(&self) -> usize {
        self.exhausted
            .iter()
            .filter(|flag| !flag.load(Ordering::Acquire))
            .count()
    }

    /// The worker's own credential while it lasts, otherwise the next live
    /// one in rotation. `None` once every credential is spent.
    pub fn checkout(&self, preferred: usize) -> Option<usize> {
        let count = self.credentials.len();
        if count == 0 {
            return None;
        }
        let own = preferred % count;
        if !self.exhausted[own].load(Ordering::Acquire) {
            return Some(own);
        }
        let start = self.rotation.fetch_add(1, Ordering::Relaxed);
        (0..count)
            .map(|step| (start + step) % count)
            .find(|idx| !self.exhausted[*idx].load(Ordering::Acquire))
    }

    /// Returns `true` the first time a credential is marked.
    pub fn mark_exhausted(&self, idx: usize) -> bool {
        let Some(flag) = self.exhausted.get(idx) else {
            return false;
        };
        let first = !flag.swap(true, Ordering::AcqRel);
        if first {
            warn!(
                target = "harvester.fetch",
                credential = %self.credentials[idx].label,
                remaining = self.available(),
                "credential_exhausted"
            );
        }
        first
    }

    /// Waits until the credential may issue its next request.
    pub async fn wait_turn(&self, idx: usize) {
        loop {
            match self.limiter.consume(idx).await {
                Ok(()) => return,
                Err(exceeded) => tokio::time::sleep(exceeded.retry_after).await,
            }
        }
    }
}

struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<usize, BucketState>>,
}

impl TokenBuckets {
    fn per_interval(interval: Duration) -> Self {
        let secs = interval.as_secs_f64();
        Self {
            rate_per_sec: if secs > 0.0 { 1.0 / secs } else { f64::INFINITY },
            capacity: 1.0,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, key: usize) -> Result<(), RateExceeded> {
        if self.rate_per_sec.is_infinite() {
            return Ok(());
        }
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            let retry_after = (deficit / self.rate_per_sec).max(0.001);
            Err(RateExceeded {
                retry_after: Duration::from_secs_f64(retry_after),
            })
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
struct RateExceeded {
    retry_after: Duration,
}
