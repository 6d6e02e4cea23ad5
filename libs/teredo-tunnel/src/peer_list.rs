use lru::LruCache;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::net::{Ipv6Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How long a peer entry survives without activity.
pub const PEER_TTL_SECS: u64 = 30;

/// Per-peer state tracked by the relay datapath.
#[derive(Debug, Default)]
pub struct PeerEntry {
    /// Learned UDP endpoint of the peer (or of the relay serving it).
    pub mapped: Option<SocketAddrV4>,
    /// A validated direct path exists; payloads may flow without bubbles.
    pub trusted: bool,
    /// Bubble pairs sent in the current establishment cycle.
    pub bubbles_sent: u8,
    /// Echo requests sent in the current establishment cycle.
    pub pings_sent: u8,
    pub last_rx: u64,
    pub last_tx: u64,
    /// Last bubble or ping transmission, for the 2 s pacing.
    pub last_xmit: u64,
    queue: VecDeque<Vec<u8>>,
    queued_bytes: usize,
}

impl PeerEntry {
    /// Queues a payload until the path to the peer is established. Oldest
    /// payloads are dropped first once `limit` bytes are exceeded.
    pub fn enqueue(&mut self, packet: &[u8], limit: usize) {
        if packet.len() > limit {
            tracing::warn!(len = packet.len(), "Payload exceeds the whole pending-queue budget");
            return;
        }

        self.queue.push_back(packet.to_vec());
        self.queued_bytes += packet.len();

        while self.queued_bytes > limit {
            let dropped = self
                .queue
                .pop_front()
                .expect("queue cannot be empty while over its byte budget");
            self.queued_bytes -= dropped.len();

            tracing::debug!("Pending queue overflow, dropping oldest payload");
        }
    }

    /// Takes all pending payloads, in the order they were queued.
    pub fn take_queue(&mut self) -> VecDeque<Vec<u8>> {
        self.queued_bytes = 0;
        std::mem::take(&mut self.queue)
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }
}

struct Slot {
    state: Mutex<PeerEntry>,
    expiry: AtomicU64,
}

/// A looked-up peer; drop the guard returned by [`PeerRef::lock`] to end the
/// critical section.
pub struct PeerRef {
    slot: Arc<Slot>,
    created: bool,
}

impl PeerRef {
    /// Did this lookup create the entry?
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn lock(&self) -> MutexGuard<'_, PeerEntry> {
        self.slot.state.lock()
    }

    /// Refreshes the entry's expiry after activity.
    pub fn touch(&self, now: u64) {
        self.slot.expiry.store(now + PEER_TTL_SECS, Ordering::Relaxed);
    }
}

/// Bounded cache of peer entries, keyed by the peer's IPv6 address.
///
/// Lookups refresh recency; entries idle for [`PEER_TTL_SECS`] are reaped on
/// lookup (at most one sweep per second) and a full list refuses new
/// entries. Entry expiry lives outside the per-entry mutex so the sweep
/// never contends with a held entry.
pub struct PeerList {
    inner: Mutex<Inner>,
    queue_bytes: usize,
}

struct Inner {
    entries: LruCache<Ipv6Addr, Arc<Slot>>,
    capacity: usize,
    last_sweep: u64,
}

impl PeerList {
    pub fn new(capacity: usize, queue_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                capacity,
                last_sweep: 0,
            }),
            queue_bytes,
        }
    }

    /// Per-peer byte budget for pending payloads.
    pub fn queue_limit(&self) -> usize {
        self.queue_bytes
    }

    /// Returns the entry for `addr`, creating it if there is room.
    pub fn lookup(&self, now: u64, addr: Ipv6Addr) -> Option<PeerRef> {
        let mut inner = self.inner.lock();

        inner.maybe_sweep(now);

        if let Some(slot) = inner.entries.get(&addr) {
            if slot.expiry.load(Ordering::Relaxed) > now {
                return Some(PeerRef {
                    slot: Arc::clone(slot),
                    created: false,
                });
            }

            // Expired but not yet swept; recreate below.
            inner.entries.pop(&addr);
        }

        if inner.entries.len() >= inner.capacity {
            tracing::debug!(capacity = inner.capacity, "Peer list is full");
            return None;
        }

        let slot = Arc::new(Slot {
            state: Mutex::new(PeerEntry::default()),
            expiry: AtomicU64::new(now + PEER_TTL_SECS),
        });
        inner.entries.put(addr, Arc::clone(&slot));

        Some(PeerRef {
            slot,
            created: true,
        })
    }

    /// Like [`PeerList::lookup`] but never creates an entry.
    pub fn find(&self, now: u64, addr: Ipv6Addr) -> Option<PeerRef> {
        let mut inner = self.inner.lock();

        inner.maybe_sweep(now);

        let slot = inner.entries.get(&addr)?;
        if slot.expiry.load(Ordering::Relaxed) <= now {
            return None;
        }

        Some(PeerRef {
            slot: Arc::clone(slot),
            created: false,
        })
    }

    /// Drops the entry for `addr`, e.g. when a peer proved unreachable.
    pub fn remove(&self, addr: Ipv6Addr) {
        self.inner.lock().entries.pop(&addr);
    }

    /// Adjusts the capacity; excess least-recently-used entries are evicted
    /// immediately.
    pub fn reset(&self, capacity: usize) {
        let mut inner = self.inner.lock();

        inner.capacity = capacity;
        while inner.entries.len() > capacity {
            inner.entries.pop_lru();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    /// Reaps expired entries, at most once per second.
    fn maybe_sweep(&mut self, now: u64) {
        if now == self.last_sweep {
            return;
        }
        self.last_sweep = now;

        let expired = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.expiry.load(Ordering::Relaxed) <= now)
            .map(|(addr, _)| *addr)
            .collect::<Vec<_>>();

        for addr in expired {
            self.entries.pop(&addr);
        }
    }
}
