#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The three routing policies: `ROUND_ROBIN`, `SHORTEST_QUEUE`, and
//! `RESOURCES_AWARE`. All three share one entry point, [`Policy::dispatch`],
//! and are bound once at start-up from [`config::PolicyKind`] — no hot-swap.
//!
//! `original_source/controller_flex.py`'s dispatch loop inlines all three
//! strategies as `if/elif` branches over a `load_balance_method` string
//! compared on every batch; this crate instead resolves the string once, at
//! config load, and keeps the per-policy state (the round-robin cursor) in
//! the `Policy` value so the hot loop never re-parses anything.

use std::sync::atomic::{AtomicUsize, Ordering};

use config::PolicyKind;
use message::Dispatchable;
use shared_load::LoadBlock;

/// Errors raised while dispatching a batch.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Enqueuing a routed item to its target replica failed.
    #[error("failed to enqueue to replica {replica_id}: {reason}")]
    Enqueue {
        /// The replica the enqueue was targeting.
        replica_id: usize,
        /// The failure reported by the target.
        reason: String,
    },

    /// `RESOURCES_AWARE` could not read or update the shared load block.
    #[error("shared load block error during resources_aware dispatch: {0}")]
    LoadBlock(#[from] shared_load::Error),

    /// The batch was non-empty but the worker table had no replicas.
    #[error("cannot dispatch a non-empty batch to zero replicas")]
    NoReplicas,
}

/// Something a [`Policy`] can query for queue depth and hand a routed item
/// to. Implemented by `dispatcher` over a `worker::WorkerTable` — kept as a
/// trait here so this crate never needs to depend on the process-spawning
/// machinery, mirroring `intake::Broadcaster`.
pub trait Targets: Send + Sync {
    /// The current ingress-queue depth of every replica, in replica-id
    /// order. Must be cheap and non-blocking (§4.F.2).
    fn depths(&self) -> Vec<usize>;

    /// Hands `item` to replica `replica_id`'s ingress queue.
    fn enqueue(&self, replica_id: usize, item: Dispatchable) -> Result<(), String>;
}

/// A bound routing policy, holding whatever state it needs across batches.
///
/// Only `ROUND_ROBIN` carries cross-batch state (the cursor); the other two
/// policies are stateless beyond what `Targets` and the shared load block
/// already hold, but all three are reached through the same method so the
/// dispatcher loop never branches on policy kind itself.
pub struct Policy {
    kind: PolicyKind,
    cursor: AtomicUsize,
}

impl Policy {
    /// Binds a new policy of the given kind, with a fresh `ROUND_ROBIN`
    /// cursor at zero.
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            cursor: AtomicUsize::new(0),
        }
    }

    /// The kind of policy this value implements.
    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    /// Routes every item in `batch`, in order, to exactly one replica each
    /// (§4.F). `load_block` and `threshold` are only consulted by
    /// `RESOURCES_AWARE`; `ROUND_ROBIN` and `SHORTEST_QUEUE` ignore them.
    pub fn dispatch(
        &self,
        batch: &[Dispatchable],
        targets: &dyn Targets,
        load_block: &LoadBlock,
        threshold: i64,
    ) -> Result<(), Error> {
        if batch.is_empty() {
            return Ok(());
        }
        match self.kind {
            PolicyKind::RoundRobin => self.round_robin(batch, targets),
            PolicyKind::ShortestQueue => self.shortest_queue(batch, targets),
            PolicyKind::ResourcesAware => self.resources_aware(batch, targets, load_block, threshold),
        }
    }

    fn round_robin(&self, batch: &[Dispatchable], targets: &dyn Targets) -> Result<(), Error> {
        let num_replicas = targets.depths().len();
        if num_replicas == 0 {
            return Err(Error::NoReplicas);
        }

        for item in batch {
            let target = self
                .cursor
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some((c + 1) % num_replicas))
                .expect("closure always returns Some");
            enqueue(targets, target, item.clone())?;
        }
        Ok(())
    }

    fn shortest_queue(&self, batch: &[Dispatchable], targets: &dyn Targets) -> Result<(), Error> {
        for item in batch {
            let depths = targets.depths();
            if depths.is_empty() {
                return Err(Error::NoReplicas);
            }
            let target = depths
                .iter()
                .enumerate()
                .min_by_key(|&(_, depth)| depth)
                .map(|(id, _)| id)
                .expect("non-empty depths");
            enqueue(targets, target, item.clone())?;
        }
        Ok(())
    }

    fn resources_aware(
        &self,
        batch: &[Dispatchable],
        targets: &dyn Targets,
        load_block: &LoadBlock,
        threshold: i64,
    ) -> Result<(), Error> {
        let snapshot = load_block.read_snapshot()?;
        let num_replicas = snapshot.num_replicas();
        if num_replicas == 0 {
            return Err(Error::NoReplicas);
        }

        let mut remained_token = snapshot.current_bs;
        let mut available_mem = snapshot.available_kv_cache;
        let mut num_reqs = snapshot.num_reqs;
        let mut eligible: Vec<usize> = (0..num_replicas)
            .filter(|&i| available_mem[i] - remained_token[i] > threshold)
            .collect();

        tracing::trace!(num_replicas, threshold, ?eligible, "resources_aware batch start");

        for item in batch {
            let input_len = item.input_len();
            let drawn_from_eligible = !eligible.is_empty();

            let target = if drawn_from_eligible {
                eligible.sort_by_key(|&id| (remained_token[id], id));
                eligible[0]
            } else {
                (0..num_replicas)
                    .min_by_key(|&id| (num_reqs[id], id))
                    .expect("num_replicas > 0")
            };

            enqueue(targets, target, item.clone())?;

            num_reqs[target] += 1;
            remained_token[target] += input_len;
            available_mem[target] -= input_len;

            if drawn_from_eligible && available_mem[target] - remained_token[target] <= threshold {
                let _ = eligible.remove(0);
                tracing::trace!(replica_id = target, "replica dropped from eligible set");
            }

            load_block.reserve(target, input_len)?;
        }

        Ok(())
    }
}

fn enqueue(targets: &dyn Targets, replica_id: usize, item: Dispatchable) -> Result<(), Error> {
    targets.enqueue(replica_id, item).map_err(|reason| Error::Enqueue { replica_id, reason })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use message::{Abort, Request};
    use shared_load::LoadBlock;

    use super::*;

    #[derive(Default)]
    struct FakeTargets {
        depths: Mutex<Vec<usize>>,
        enqueued: Mutex<Vec<(usize, Dispatchable)>>,
    }

    impl FakeTargets {
        fn new(depths: Vec<usize>) -> Self {
            Self {
                depths: Mutex::new(depths),
                enqueued: Mutex::new(Vec::new()),
            }
        }

        fn targets_in_order(&self) -> Vec<usize> {
            self.enqueued.lock().unwrap().iter().map(|(id, _)| *id).collect()
        }
    }

    impl Targets for FakeTargets {
        fn depths(&self) -> Vec<usize> {
            self.depths.lock().unwrap().clone()
        }

        fn enqueue(&self, replica_id: usize, item: Dispatchable) -> Result<(), String> {
            self.depths.lock().unwrap()[replica_id] += 1;
            self.enqueued.lock().unwrap().push((replica_id, item));
            Ok(())
        }
    }

    fn req(rid: &str, len: usize) -> Dispatchable {
        Dispatchable::Request(Request::new(rid, vec![1; len]))
    }

    fn dummy_load_block() -> LoadBlock {
        LoadBlock::new(1, 0)
    }

    #[test]
    fn round_robin_s1() {
        let policy = Policy::new(PolicyKind::RoundRobin);
        let targets = FakeTargets::new(vec![0, 0, 0]);
        let batch: Vec<Dispatchable> = (0..5).map(|i| req(&format!("r{i}"), 1)).collect();

        policy.dispatch(&batch, &targets, &dummy_load_block(), 100).unwrap();

        assert_eq!(targets.targets_in_order(), vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn round_robin_treats_an_in_batch_abort_like_any_other_item_s5() {
        let policy = Policy::new(PolicyKind::RoundRobin);
        let targets = FakeTargets::new(vec![0, 0]);
        let batch = vec![Dispatchable::Abort(Abort::new("a")), req("b", 1), req("c", 1)];

        policy.dispatch(&batch, &targets, &dummy_load_block(), 100).unwrap();

        assert_eq!(targets.targets_in_order(), vec![0, 1, 0]);
    }

    #[test]
    fn shortest_queue_s2() {
        let policy = Policy::new(PolicyKind::ShortestQueue);
        let targets = FakeTargets::new(vec![4, 1, 2]);
        let batch: Vec<Dispatchable> = (0..4).map(|i| req(&format!("r{i}"), 1)).collect();

        policy.dispatch(&batch, &targets, &dummy_load_block(), 100).unwrap();

        assert_eq!(targets.targets_in_order(), vec![1, 1, 2, 1]);
    }

    #[test]
    fn resources_aware_s3() {
        let policy = Policy::new(PolicyKind::ResourcesAware);
        let targets = FakeTargets::new(vec![0, 0]);
        let load_block = LoadBlock::new(2, 0);
        load_block.apply_report(shared_load::LoadReport {
            replica_id: 0,
            delta_current_bs: 0,
            delta_available_kv_cache: 1000,
            delta_num_reqs: 0,
        }).unwrap();
        load_block.apply_report(shared_load::LoadReport {
            replica_id: 1,
            delta_current_bs: 0,
            delta_available_kv_cache: 500,
            delta_num_reqs: 0,
        }).unwrap();

        let batch = vec![req("r0", 200), req("r1", 200), req("r2", 200)];
        policy.dispatch(&batch, &targets, &load_block, 100).unwrap();

        assert_eq!(targets.targets_in_order(), vec![0, 1, 0]);
        let snapshot = load_block.read_snapshot().unwrap();
        assert_eq!(snapshot.current_bs, vec![400, 200]);
    }

    #[test]
    fn resources_aware_falls_back_to_argmin_num_reqs_when_no_headroom_s4() {
        let policy = Policy::new(PolicyKind::ResourcesAware);
        let targets = FakeTargets::new(vec![0, 0]);
        let load_block = LoadBlock::new(2, 0);
        load_block.apply_report(shared_load::LoadReport {
            replica_id: 0,
            delta_current_bs: 0,
            delta_available_kv_cache: 50,
            delta_num_reqs: 5,
        }).unwrap();
        load_block.apply_report(shared_load::LoadReport {
            replica_id: 1,
            delta_current_bs: 0,
            delta_available_kv_cache: 60,
            delta_num_reqs: 2,
        }).unwrap();

        let batch = vec![req("r0", 1), req("r1", 1), req("r2", 1)];
        policy.dispatch(&batch, &targets, &load_block, 100).unwrap();

        assert_eq!(targets.targets_in_order(), vec![1, 1, 1]);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let policy = Policy::new(PolicyKind::RoundRobin);
        let targets = FakeTargets::new(vec![0, 0]);

        policy.dispatch(&[], &targets, &dummy_load_block(), 100).unwrap();

        assert!(targets.targets_in_order().is_empty());
    }
}
