//! Load-balancing policies over a route's backend set.
//!
//! Every policy implements [`Balancer`] and only ever hands out backends
//! whose `alive` flag is set. `update` swaps in a new backend list while
//! preserving the `Backend` records (and therefore their health and
//! in-flight state) of URLs that are unchanged, which is what keeps reloads
//! from resetting observable state.
use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

use crate::{
    config::{BackendConfig, LbAlgorithm},
    core::backend::{Backend, BackendError},
};

/// Returned when every backend of a route is marked not alive.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no healthy backend available")]
pub struct NoHealthyBackend;

/// Strategy interface for backend selection.
///
/// Implementations are internally synchronised; `next` runs on the request
/// hot path and must not block beyond its own fine-grained lock.
pub trait Balancer: Send + Sync {
    /// Select a backend for a request originating from `client_ip`.
    fn next(&self, client_ip: &str) -> Result<Arc<Backend>, NoHealthyBackend>;

    /// Snapshot of the current backend list (alive or not).
    fn backends(&self) -> Vec<Arc<Backend>>;

    /// Swap in a new backend list, reusing records whose URL is unchanged.
    fn update(&self, cfgs: &[BackendConfig]) -> Result<(), BackendError>;
}

/// Build a balancer of the given kind from configured backends.
pub fn build(
    algorithm: LbAlgorithm,
    cfgs: &[BackendConfig],
) -> Result<Arc<dyn Balancer>, BackendError> {
    let backends = merge_backends(&[], cfgs)?;
    Ok(from_backends(algorithm, backends))
}

/// Build a balancer of the given kind around existing backend records.
/// Used by the reloader when the algorithm of a route changes but some of
/// its backends survive.
pub fn from_backends(algorithm: LbAlgorithm, backends: Vec<Arc<Backend>>) -> Arc<dyn Balancer> {
    match algorithm {
        LbAlgorithm::RoundRobin => Arc::new(RoundRobin::new(backends)),
        LbAlgorithm::LeastConn => Arc::new(LeastConn::new(backends)),
        LbAlgorithm::Weighted => Arc::new(Weighted::new(backends)),
        LbAlgorithm::IpHash => Arc::new(IpHash::new(backends)),
    }
}

/// Merge a new backend config list into existing records: URLs already
/// present keep their record (only the weight is written), new URLs get a
/// fresh record, dropped URLs are left behind.
pub fn merge_backends(
    existing: &[Arc<Backend>],
    cfgs: &[BackendConfig],
) -> Result<Vec<Arc<Backend>>, BackendError> {
    let mut merged = Vec::with_capacity(cfgs.len());
    for cfg in cfgs {
        let url = cfg.url.trim_end_matches('/');
        match existing.iter().find(|b| b.url() == url) {
            Some(b) => {
                b.set_weight(cfg.weight);
                merged.push(b.clone());
            }
            None => merged.push(Backend::new(&cfg.url, cfg.weight)?),
        }
    }
    Ok(merged)
}

fn alive_subset(backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
    backends.iter().filter(|b| b.is_alive()).cloned().collect()
}

// ---------------------------------------------------------------------------
// Round-robin
// ---------------------------------------------------------------------------

/// Cycles through the alive subset with an atomic counter; the only lock on
/// the hot path is the read lock on the backend slice.
pub struct RoundRobin {
    backends: RwLock<Vec<Arc<Backend>>>,
    counter: AtomicU64,
}

impl RoundRobin {
    fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends: RwLock::new(backends),
            counter: AtomicU64::new(0),
        }
    }
}

impl Balancer for RoundRobin {
    fn next(&self, _client_ip: &str) -> Result<Arc<Backend>, NoHealthyBackend> {
        let alive = alive_subset(&self.backends.read().expect("backend lock poisoned"));
        if alive.is_empty() {
            return Err(NoHealthyBackend);
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(alive[(idx % alive.len() as u64) as usize].clone())
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().expect("backend lock poisoned").clone()
    }

    fn update(&self, cfgs: &[BackendConfig]) -> Result<(), BackendError> {
        let mut guard = self.backends.write().expect("backend lock poisoned");
        *guard = merge_backends(&guard, cfgs)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Least connections
// ---------------------------------------------------------------------------

/// Picks the alive backend with the fewest in-flight requests; ties go to
/// the first occurrence in configuration order.
pub struct LeastConn {
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl LeastConn {
    fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends: RwLock::new(backends),
        }
    }
}

impl Balancer for LeastConn {
    fn next(&self, _client_ip: &str) -> Result<Arc<Backend>, NoHealthyBackend> {
        let alive = alive_subset(&self.backends.read().expect("backend lock poisoned"));
        let mut best: Option<&Arc<Backend>> = None;
        for b in &alive {
            match best {
                Some(current) if b.inflight() >= current.inflight() => {}
                _ => best = Some(b),
            }
        }
        best.cloned().ok_or(NoHealthyBackend)
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().expect("backend lock poisoned").clone()
    }

    fn update(&self, cfgs: &[BackendConfig]) -> Result<(), BackendError> {
        let mut guard = self.backends.write().expect("backend lock poisoned");
        *guard = merge_backends(&guard, cfgs)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Smooth weighted round-robin
// ---------------------------------------------------------------------------

struct WeightedSlot {
    backend: Arc<Backend>,
    current: i64,
}

/// Smooth weighted round-robin (the nginx algorithm): each pick adds every
/// alive backend's weight to its `current` score, selects the highest score,
/// then subtracts the total alive weight from the winner. With weights
/// 5,1,1 this yields A,A,B,A,C,A,A rather than a burst of five As.
pub struct Weighted {
    slots: Mutex<Vec<WeightedSlot>>,
}

impl Weighted {
    fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            slots: Mutex::new(
                backends
                    .into_iter()
                    .map(|backend| WeightedSlot {
                        backend,
                        current: 0,
                    })
                    .collect(),
            ),
        }
    }
}

impl Balancer for Weighted {
    fn next(&self, _client_ip: &str) -> Result<Arc<Backend>, NoHealthyBackend> {
        let mut slots = self.slots.lock().expect("weighted lock poisoned");
        let mut total: i64 = 0;
        let mut best: Option<(usize, i64)> = None;
        for (i, slot) in slots.iter_mut().enumerate() {
            if !slot.backend.is_alive() {
                continue;
            }
            let weight = i64::from(slot.backend.weight());
            slot.current += weight;
            total += weight;
            match best {
                Some((_, best_current)) if best_current >= slot.current => {}
                _ => best = Some((i, slot.current)),
            }
        }
        let (best, _) = best.ok_or(NoHealthyBackend)?;
        slots[best].current -= total;
        Ok(slots[best].backend.clone())
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.slots
            .lock()
            .expect("weighted lock poisoned")
            .iter()
            .map(|s| s.backend.clone())
            .collect()
    }

    fn update(&self, cfgs: &[BackendConfig]) -> Result<(), BackendError> {
        let mut slots = self.slots.lock().expect("weighted lock poisoned");
        let existing: Vec<Arc<Backend>> = slots.iter().map(|s| s.backend.clone()).collect();
        let merged = merge_backends(&existing, cfgs)?;
        *slots = merged
            .into_iter()
            .map(|backend| WeightedSlot {
                backend,
                current: 0,
            })
            .collect();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IP hash
// ---------------------------------------------------------------------------

/// Sticky selection by FNV-1a hash of the client IP. Stickiness degrades
/// when the alive set changes; that is accepted.
pub struct IpHash {
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl IpHash {
    fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends: RwLock::new(backends),
        }
    }
}

impl Balancer for IpHash {
    fn next(&self, client_ip: &str) -> Result<Arc<Backend>, NoHealthyBackend> {
        let alive = alive_subset(&self.backends.read().expect("backend lock poisoned"));
        if alive.is_empty() {
            return Err(NoHealthyBackend);
        }
        let h = fnv1a(client_ip);
        Ok(alive[(h % alive.len() as u32) as usize].clone())
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().expect("backend lock poisoned").clone()
    }

    fn update(&self, cfgs: &[BackendConfig]) -> Result<(), BackendError> {
        let mut guard = self.backends.write().expect("backend lock poisoned");
        *guard = merge_backends(&guard, cfgs)?;
        Ok(())
    }
}

/// FNV-1a, 32-bit: byte-wise XOR then multiply, wrapping arithmetic.
fn fnv1a(s: &str) -> u32 {
    let mut h: u32 = 0x811C_9DC5;
    for byte in s.as_bytes() {
        h ^= u32::from(*byte);
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}
