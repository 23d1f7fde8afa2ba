//! Per-flow tunnel context table
//!
//! Tracks interception state for every live tunnel flow. Buckets are locked
//! individually so concurrent classify calls only contend when they hash to
//! the same bucket; within a bucket, entries sit in a HashMap index for O(1)
//! key lookup and on an intrusive chain for O(1) unlink and O(1) bulk
//! eviction.

use crate::config::FilterConfig;
use crate::error::{FilterError, Result};
use crate::flow::{FlowKey, RedirectTarget, TunnelKind};
use crate::list::{ListArena, NodeId};
use crate::stats::FilterStats;
use crate::timestamp_micros;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Per-flow interception state.
///
/// Owned exclusively by the table; classify callbacks and enumerators only
/// ever see clones (transient, non-owning views).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelContext {
    /// Unique id, fresh for every creation (an invalidated and re-learned
    /// flow gets a new id)
    pub id: u64,
    /// Outer 5-tuple the context is keyed on
    pub key: FlowKey,
    /// Encapsulation type
    pub kind: TunnelKind,
    /// Where packets of this flow are steered
    pub redirect: RedirectTarget,
    /// Number of classify-time references handed out
    pub ref_count: u64,
    /// Packets observed for this flow
    pub packets: u64,
    /// Creation time, microseconds
    pub first_seen: u64,
    /// Last classification time, microseconds
    pub last_seen: u64,
}

impl TunnelContext {
    fn new(id: u64, key: FlowKey, kind: TunnelKind, redirect: RedirectTarget) -> Self {
        let now = timestamp_micros();
        Self {
            id,
            key,
            kind,
            redirect,
            ref_count: 0,
            packets: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Local (destination-side) tunnel endpoint
    pub fn local_endpoint(&self) -> (u32, u16) {
        (self.key.dst_ip, self.key.dst_port)
    }

    /// Remote (source-side) tunnel endpoint
    pub fn remote_endpoint(&self) -> (u32, u16) {
        (self.key.src_ip, self.key.src_port)
    }
}

struct Bucket {
    index: HashMap<FlowKey, NodeId>,
    arena: ListArena<TunnelContext>,
    chain: NodeId,
}

impl Bucket {
    fn new() -> Self {
        let mut arena = ListArena::new();
        let chain = arena.new_list();
        Self {
            index: HashMap::new(),
            arena,
            chain,
        }
    }

    /// Splice the whole chain out and free every entry. Returns the number
    /// of entries evicted.
    fn evict_all(&mut self) -> u64 {
        let drain = self.arena.new_list();
        if !self.arena.is_empty(self.chain) {
            let first = self.arena.front(self.chain);
            self.arena.splice(drain, first, self.chain);
        }
        let mut evicted = 0;
        while !self.arena.is_empty(drain) {
            let node = self.arena.pop_front(drain);
            self.arena.free(node);
            evicted += 1;
        }
        self.arena.free(drain);
        self.index.clear();
        evicted
    }
}

/// Concurrent table of all live [`TunnelContext`] entries
pub struct TunnelContextTable {
    buckets: Box<[Mutex<Bucket>]>,
    mask: u64,
    count: AtomicU64,
    max_contexts: usize,
    default_redirect: RedirectTarget,
    next_id: AtomicU64,
    stats: Arc<FilterStats>,
}

impl TunnelContextTable {
    /// Create a table sized per `config`
    pub fn new(config: &FilterConfig, stats: Arc<FilterStats>) -> Self {
        let bucket_count = config.bucket_count.max(1).next_power_of_two();
        let buckets: Vec<Mutex<Bucket>> =
            (0..bucket_count).map(|_| Mutex::new(Bucket::new())).collect();
        Self {
            buckets: buckets.into_boxed_slice(),
            mask: (bucket_count - 1) as u64,
            count: AtomicU64::new(0),
            max_contexts: config.max_contexts,
            default_redirect: RedirectTarget::Datapath {
                port: config.default_datapath_port,
            },
            next_id: AtomicU64::new(1),
            stats,
        }
    }

    #[inline]
    fn bucket_for(&self, key: &FlowKey) -> &Mutex<Bucket> {
        &self.buckets[(key.hash64() & self.mask) as usize]
    }

    /// Return the context for `key`, creating it if absent.
    ///
    /// The returned value is a snapshot; the table keeps ownership. Two
    /// callers racing on the same fresh key get the same context (the bucket
    /// lock covers the check-and-insert). Fails with
    /// [`FilterError::ContextTableFull`] at capacity, in which case the
    /// packet is expected to pass through unclassified.
    pub fn lookup_or_create(&self, key: FlowKey, kind: TunnelKind) -> Result<TunnelContext> {
        let mut bucket = self.bucket_for(&key).lock();
        if let Some(&node) = bucket.index.get(&key) {
            let ctx = bucket
                .arena
                .get_mut(node)
                .expect("indexed node lost its context");
            ctx.ref_count += 1;
            ctx.packets += 1;
            ctx.last_seen = timestamp_micros();
            return Ok(ctx.clone());
        }

        if self.count.load(Ordering::Relaxed) as usize >= self.max_contexts {
            return Err(FilterError::ContextTableFull);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut ctx = TunnelContext::new(id, key, kind, self.default_redirect);
        ctx.ref_count = 1;
        ctx.packets = 1;
        let snapshot = ctx.clone();

        let node = bucket.arena.alloc(ctx);
        let chain = bucket.chain;
        bucket.arena.push_back(chain, node);
        bucket.index.insert(key, node);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.stats.record_context_create();
        debug!(?key, ?kind, id, "tunnel context created");
        Ok(snapshot)
    }

    /// Snapshot of the context for `key`, if present
    pub fn lookup(&self, key: &FlowKey) -> Option<TunnelContext> {
        let bucket = self.bucket_for(key).lock();
        let node = *bucket.index.get(key)?;
        bucket.arena.get(node).cloned()
    }

    /// Steer an existing flow; returns false if the flow is unknown
    pub fn set_redirect(&self, key: &FlowKey, target: RedirectTarget) -> bool {
        let mut bucket = self.bucket_for(key).lock();
        let Some(&node) = bucket.index.get(key) else {
            return false;
        };
        if let Some(ctx) = bucket.arena.get_mut(node) {
            ctx.redirect = target;
            true
        } else {
            false
        }
    }

    /// Remove the context for `key`; returns whether an entry was removed
    pub fn invalidate(&self, key: &FlowKey) -> bool {
        let mut bucket = self.bucket_for(key).lock();
        let Some(node) = bucket.index.remove(key) else {
            return false;
        };
        bucket.arena.remove(node);
        bucket.arena.free(node);
        drop(bucket);
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.stats.record_context_invalidations(1);
        debug!(?key, "tunnel context invalidated");
        true
    }

    /// Drop every entry; used on engine stop and driver unload. Returns the
    /// number of entries removed.
    pub fn invalidate_all(&self) -> u64 {
        let mut total = 0;
        for bucket in self.buckets.iter() {
            let evicted = bucket.lock().evict_all();
            if evicted > 0 {
                self.count.fetch_sub(evicted, Ordering::Relaxed);
                total += evicted;
            }
        }
        if total > 0 {
            self.stats.record_context_invalidations(total);
            debug!(total, "tunnel context table flushed");
        }
        total
    }

    /// Lazy, non-restartable walk over current entries.
    ///
    /// One bucket is snapshotted at a time; entries removed while the
    /// enumerator is live are simply absent from later steps.
    pub fn enumerate(&self) -> ContextEnumerator<'_> {
        ContextEnumerator {
            table: self,
            next_bucket: 0,
            pending: Vec::new().into_iter(),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    /// True when no entries are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterator returned by [`TunnelContextTable::enumerate`]
pub struct ContextEnumerator<'a> {
    table: &'a TunnelContextTable,
    next_bucket: usize,
    pending: std::vec::IntoIter<TunnelContext>,
}

impl Iterator for ContextEnumerator<'_> {
    type Item = TunnelContext;

    fn next(&mut self) -> Option<TunnelContext> {
        loop {
            if let Some(ctx) = self.pending.next() {
                return Some(ctx);
            }
            if self.next_bucket >= self.table.buckets.len() {
                return None;
            }
            let bucket = self.table.buckets[self.next_bucket].lock();
            self.next_bucket += 1;
            let snapshot: Vec<TunnelContext> = bucket
                .arena
                .iter(bucket.chain)
                .map(|(_, ctx)| ctx.clone())
                .collect();
            self.pending = snapshot.into_iter();
        }
    }
}
