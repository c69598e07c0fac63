use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use bytes::Bytes;
use futures::FutureExt;
use slotmap::SlotMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::cache::{CacheConfig, CachedResponse, CommandRequest, StoreOptions};
use crate::collections::HashMap;
use crate::mqtt::Publish;

slotmap::new_key_type! {
    /// Heap elements refer to entries by key; a removed entry's key never resolves again.
    pub(super) struct EntryKey;
}

/// Identifies one occurrence of a request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(super) struct FullCorrelationId {
    pub topic: String,
    pub correlation_data: Bytes,
}

/// Identifies the content of a request, for reuse across correlation IDs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(super) struct FullRequest {
    pub command_name: String,
    /// Empty if the response may be reused for any invoker.
    pub invoker_id: String,
    pub payload: Bytes,
}

struct ReuseReference {
    key: EntryKey,
    /// `None` while the response is pending.
    ttl: Option<Instant>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ExpiryQueue {
    Dedup,
    Reuse,
}

/// A retention window that isn't scheduled yet.
#[derive(Copy, Clone, Debug)]
struct Deferred {
    queue: ExpiryQueue,
    at: Instant,
    benefit: Benefit,
}

/// Saved execution time per byte stored. Higher is more worth keeping.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(super) struct Benefit(pub f64);

impl Eq for Benefit {}

impl PartialOrd for Benefit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Benefit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

struct Entry {
    correlation_id: FullCorrelationId,
    full_request: Option<FullRequest>,
    sender: Option<oneshot::Sender<Publish>>,
    response: CachedResponse,
    /// Bytes counted against the aggregate limit; zero until the response is stored.
    size: u64,
    is_dedup_mandatory: bool,
    /// The one expiry queue element that is live for this entry.
    scheduled_expiry: Option<(ExpiryQueue, Instant)>,
    /// The cost/benefit queue element that is live for this entry, if it may be evicted.
    scheduled_benefit: Option<Benefit>,
    deferred: Option<Deferred>,
}

#[derive(Default)]
pub(super) struct CacheState {
    pub config: CacheConfig,
    pub started: bool,
    entries: SlotMap<EntryKey, Entry>,
    by_correlation: HashMap<FullCorrelationId, EntryKey>,
    reuse_references: HashMap<FullRequest, ReuseReference>,
    dedup_queue: BinaryHeap<Reverse<(Instant, EntryKey)>>,
    reuse_queue: BinaryHeap<Reverse<(Instant, EntryKey)>>,
    cost_benefit_queue: BinaryHeap<Reverse<(Benefit, EntryKey)>>,
    aggregate_size: u64,
}

impl CacheState {
    pub fn new(config: CacheConfig) -> Self {
        CacheState {
            config,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn aggregate_size(&self) -> u64 {
        self.aggregate_size
    }

    pub fn contains(&self, id: &FullCorrelationId) -> bool {
        self.by_correlation.contains_key(id)
    }

    pub fn retrieve(
        &mut self,
        request: &CommandRequest,
        is_cacheable: bool,
        can_reuse_across_invokers: bool,
    ) -> Option<CachedResponse> {
        let correlation_id = request.correlation_id();

        if let Some(key) = self.by_correlation.get(&correlation_id) {
            tracing::trace!(topic = %correlation_id.topic, "duplicate request");
            return self.entries.get(*key).map(|entry| entry.response.clone());
        }

        let full_request = is_cacheable.then(|| FullRequest {
            command_name: request.command_name.clone(),
            invoker_id: if can_reuse_across_invokers {
                String::new()
            } else {
                request.invoker_id.clone()
            },
            payload: request.payload.clone(),
        });

        if let Some(full_request) = &full_request {
            if let Some(reuse) = self.reuse_references.get(full_request) {
                let fresh = reuse.ttl.map_or(true, |ttl| Instant::now() < ttl);

                if let Some(entry) = self.entries.get(reuse.key).filter(|_| fresh) {
                    tracing::trace!(
                        command_name = %full_request.command_name,
                        "reusing response to equivalent request"
                    );
                    return Some(entry.response.clone());
                }
            }
        }

        let (sender, receiver) = oneshot::channel();

        let key = self.entries.insert(Entry {
            correlation_id: correlation_id.clone(),
            full_request: full_request.clone(),
            sender: Some(sender),
            response: CachedResponse(receiver.shared()),
            size: 0,
            is_dedup_mandatory: true,
            scheduled_expiry: None,
            scheduled_benefit: None,
            deferred: None,
        });

        self.by_correlation.insert(correlation_id, key);

        if let Some(full_request) = full_request {
            self.reuse_references
                .insert(full_request, ReuseReference { key, ttl: None });
        }

        None
    }

    pub fn store(&mut self, request: &CommandRequest, response: Publish, options: &StoreOptions) {
        let correlation_id = request.correlation_id();

        let Some(&key) = self.by_correlation.get(&correlation_id) else {
            tracing::trace!(
                topic = %correlation_id.topic,
                "no pending entry for response; discarding"
            );
            return;
        };

        let Some(entry) = self.entries.get_mut(key) else {
            panic!("BUG: correlation index refers to a removed entry");
        };

        let Some(sender) = entry.sender.take() else {
            tracing::debug!(topic = %correlation_id.topic, "response already stored");
            return;
        };

        let request_len = entry
            .full_request
            .as_ref()
            .map_or(0, |full_request| full_request.payload.len() as u64);
        let response_len = response.payload.len() as u64;

        // Nobody waiting is fine.
        sender.send(response).ok();

        entry.size = request_len + response_len;
        entry.is_dedup_mandatory = !options.is_idempotent;
        self.aggregate_size += entry.size;

        let now = Instant::now();

        let ttl = if entry.full_request.is_some() {
            now + options.cacheable_duration
        } else {
            now
        };

        let has_expired = now >= options.command_expiration_time;
        let excessively_stale = now >= ttl;

        if has_expired && excessively_stale {
            self.remove(key);
            return;
        }

        if let Some(full_request) = &entry.full_request {
            if let Some(reuse) = self
                .reuse_references
                .get_mut(full_request)
                .filter(|reuse| reuse.key == key)
            {
                reuse.ttl = Some(ttl);
            }
        }

        let duration = options.execution_duration;
        let dedup = (!has_expired).then(|| Deferred {
            queue: ExpiryQueue::Dedup,
            at: options.command_expiration_time,
            benefit: self.config.benefit(0, response_len, duration),
        });
        let reuse = (!excessively_stale).then(|| Deferred {
            queue: ExpiryQueue::Reuse,
            at: ttl,
            benefit: self.config.benefit(request_len, response_len, duration),
        });

        let (first, deferred) = match (dedup, reuse) {
            (Some(dedup), Some(reuse)) if reuse.at < dedup.at => (reuse, Some(dedup)),
            (Some(dedup), reuse) => (dedup, reuse),
            (None, Some(reuse)) => (reuse, None),
            (None, None) => unreachable!("both windows lapsed is handled above"),
        };

        self.schedule(key, first, deferred);
        self.trim();
    }

    /// Drop a pending entry whose response will never be stored.
    ///
    /// Duplicates already waiting on it see the sender dropped. Completed entries are left alone.
    pub fn abandon(&mut self, request: &CommandRequest) -> bool {
        let correlation_id = request.correlation_id();

        let Some(&key) = self.by_correlation.get(&correlation_id) else {
            return false;
        };

        let pending = self
            .entries
            .get(key)
            .map_or(false, |entry| entry.sender.is_some());

        if pending {
            tracing::debug!(topic = %correlation_id.topic, "abandoning pending entry");
            self.remove(key);
        }

        pending
    }

    /// Remove the lowest benefit entries until the cache is within its limits.
    pub fn trim(&mut self) {
        while self.entries.len() > self.config.max_entry_count
            || self.aggregate_size > self.config.max_aggregate_payload_bytes
        {
            let Some(Reverse((benefit, key))) = self.cost_benefit_queue.pop() else {
                break;
            };

            let live = self
                .entries
                .get(key)
                .map_or(false, |entry| entry.scheduled_benefit == Some(benefit));

            if live {
                tracing::trace!(benefit = benefit.0, "evicting entry");
                self.remove(key);
            }
        }
    }

    /// The earliest live deadline in either expiry queue.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        let dedup = self.live_top(ExpiryQueue::Dedup).map(|(at, _)| at);
        let reuse = self.live_top(ExpiryQueue::Reuse).map(|(at, _)| at);

        dedup.into_iter().chain(reuse).min()
    }

    /// Process the entry with the earliest deadline if it has passed.
    ///
    /// Returns `true` if an entry was processed.
    pub fn expire_one(&mut self, now: Instant) -> bool {
        let dedup = self.live_top(ExpiryQueue::Dedup);
        let reuse = self.live_top(ExpiryQueue::Reuse);

        let (queue, peeked) = match (dedup, reuse) {
            (Some(dedup), Some(reuse)) if reuse.0 < dedup.0 => (ExpiryQueue::Reuse, reuse),
            (Some(dedup), _) => (ExpiryQueue::Dedup, dedup),
            (None, Some(reuse)) => (ExpiryQueue::Reuse, reuse),
            (None, None) => return false,
        };

        if peeked.0 > now {
            return false;
        }

        let popped = self.queue_mut(queue).pop().map(|Reverse(top)| top);

        if popped != Some(peeked) {
            panic!("BUG: {queue:?} queue yielded {popped:?} after peeking {peeked:?}");
        }

        let (_, key) = peeked;

        let Some(entry) = self.entries.get_mut(key) else {
            panic!("BUG: live expiry element refers to a removed entry");
        };

        entry.scheduled_expiry = None;

        match entry.deferred.take().filter(|deferred| now < deferred.at) {
            Some(next) => {
                tracing::trace!(?queue, next = ?next.queue, "retention window lapsed; rescheduling");
                self.schedule(key, next, None);
                self.trim();
            }
            None => {
                tracing::trace!(?queue, "entry expired");
                self.remove(key);
            }
        }

        true
    }

    fn schedule(&mut self, key: EntryKey, window: Deferred, deferred: Option<Deferred>) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };

        // A non-idempotent command stays until no invoker could still be retrying it.
        let can_evict = !(entry.is_dedup_mandatory
            && (window.queue == ExpiryQueue::Dedup
                || deferred.map_or(false, |d| d.queue == ExpiryQueue::Dedup)));

        entry.scheduled_expiry = Some((window.queue, window.at));
        entry.deferred = deferred;
        entry.scheduled_benefit = can_evict.then_some(window.benefit);

        self.queue_mut(window.queue)
            .push(Reverse((window.at, key)));

        if can_evict {
            self.cost_benefit_queue
                .push(Reverse((window.benefit, key)));
        }
    }

    /// Peek the top of `queue`, discarding elements that are no longer live.
    fn live_top(&mut self, queue: ExpiryQueue) -> Option<(Instant, EntryKey)> {
        loop {
            let Reverse((at, key)) = *self.queue_mut(queue).peek()?;

            let live = self
                .entries
                .get(key)
                .map_or(false, |entry| entry.scheduled_expiry == Some((queue, at)));

            if live {
                return Some((at, key));
            }

            self.queue_mut(queue).pop();
        }
    }

    fn queue_mut(&mut self, queue: ExpiryQueue) -> &mut BinaryHeap<Reverse<(Instant, EntryKey)>> {
        match queue {
            ExpiryQueue::Dedup => &mut self.dedup_queue,
            ExpiryQueue::Reuse => &mut self.reuse_queue,
        }
    }

    fn remove(&mut self, key: EntryKey) {
        let Some(entry) = self.entries.remove(key) else {
            return;
        };

        self.by_correlation.remove(&entry.correlation_id);

        if let Some(full_request) = &entry.full_request {
            if self
                .reuse_references
                .get(full_request)
                .map_or(false, |reuse| reuse.key == key)
            {
                self.reuse_references.remove(full_request);
            }
        }

        self.aggregate_size -= entry.size;
    }
}
