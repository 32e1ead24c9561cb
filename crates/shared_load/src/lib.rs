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

//! The shared load block: the per-replica counters the dispatcher consults to
//! route `RESOURCES_AWARE` requests, and that replica workers keep current by
//! publishing load reports.
//!
//! `original_source/controller_flex.py`'s `ControllerInfo` realizes this as a
//! `multiprocessing.shared_memory` region guarded by a `multiprocessing.Lock`,
//! because its workers are separate OS processes with no shared address
//! space. This crate instead keeps the block in-process behind an
//! `Arc<Mutex<_>>` and has workers publish updates over a channel (see
//! `worker::LoadReporter`); the dispatcher applies them here. See
//! `DESIGN.md` for the full rationale — this keeps the crate free of
//! `unsafe`, matching the rest of the workspace.

use std::sync::{Arc, Mutex};

/// Errors surfaced by the shared load block.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A replica index was out of the block's `[0, N)` range.
    #[error("replica index {index} out of range (num_replicas: {num_replicas})")]
    IndexOutOfRange {
        /// The offending index.
        index: usize,
        /// The size of the block.
        num_replicas: usize,
    },

    /// A field would have gone negative. This indicates a worker/dispatcher
    /// accounting bug and is always fatal to the caller.
    #[error("counter underflow on replica {index} (field: {field}, value: {value}, delta: {delta})")]
    Underflow {
        /// The replica whose counter underflowed.
        index: usize,
        /// The name of the field (`current_bs`, `available_kv_cache`, or
        /// `num_reqs`).
        field: &'static str,
        /// The value before applying the delta.
        value: i64,
        /// The delta that was being applied.
        delta: i64,
    },

    /// The internal mutex was poisoned by a panicking holder.
    #[error("shared load block mutex poisoned")]
    Poisoned,
}

/// A consistent, point-in-time copy of all three per-replica counter arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSnapshot {
    /// Tokens currently queued or in-flight, per replica.
    pub current_bs: Vec<i64>,
    /// Free token slots in each replica's attention cache.
    pub available_kv_cache: Vec<i64>,
    /// Number of in-flight requests, per replica.
    pub num_reqs: Vec<i64>,
}

impl LoadSnapshot {
    /// The number of replicas this snapshot covers.
    pub fn num_replicas(&self) -> usize {
        self.current_bs.len()
    }
}

/// A load update published by a replica worker upon request completion or
/// admission. All deltas are applied atomically, under the block's mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct LoadReport {
    /// Replica this report concerns.
    pub replica_id: usize,
    /// Change in `current_bs` (may be negative — a worker freeing tokens).
    pub delta_current_bs: i64,
    /// Change in `available_kv_cache`.
    pub delta_available_kv_cache: i64,
    /// Change in `num_reqs`.
    pub delta_num_reqs: i64,
}

#[derive(Debug)]
struct Counters {
    current_bs: Vec<i64>,
    available_kv_cache: Vec<i64>,
    num_reqs: Vec<i64>,
}

/// The shared load block: a fixed-length array of per-replica counters,
/// allocated once at start-up and never resized, guarded by a single mutex
/// (`L` in the spec).
#[derive(Debug, Clone)]
pub struct LoadBlock {
    inner: Arc<Mutex<Counters>>,
    num_replicas: usize,
}

impl LoadBlock {
    /// Allocates a new load block for `num_replicas` replicas, with every
    /// counter initialized to zero except `available_kv_cache`, which starts
    /// at `initial_kv_cache` tokens per replica.
    pub fn new(num_replicas: usize, initial_kv_cache: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Counters {
                current_bs: vec![0; num_replicas],
                available_kv_cache: vec![initial_kv_cache; num_replicas],
                num_reqs: vec![0; num_replicas],
            })),
            num_replicas,
        }
    }

    /// The number of replicas this block was allocated for.
    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Counters>, Error> {
        self.inner.lock().map_err(|_| Error::Poisoned)
    }

    fn check_index(&self, index: usize) -> Result<(), Error> {
        if index >= self.num_replicas {
            return Err(Error::IndexOutOfRange {
                index,
                num_replicas: self.num_replicas,
            });
        }
        Ok(())
    }

    /// Returns a consistent copy of all three counter arrays (acquire `L`,
    /// copy, release).
    pub fn read_snapshot(&self) -> Result<LoadSnapshot, Error> {
        let counters = self.lock()?;
        Ok(LoadSnapshot {
            current_bs: counters.current_bs.clone(),
            available_kv_cache: counters.available_kv_cache.clone(),
            num_reqs: counters.num_reqs.clone(),
        })
    }

    /// Reserves `input_len` tokens of capacity at replica `i`: under `L`,
    /// `current_bs[i] += input_len`. This is the only field the dispatcher
    /// itself mutates (§4.F.3 step 5); `input_len` is always non-negative so
    /// this can never underflow.
    pub fn reserve(&self, index: usize, input_len: i64) -> Result<(), Error> {
        self.check_index(index)?;
        let mut counters = self.lock()?;
        counters.current_bs[index] += input_len;
        tracing::trace!(replica_id = index, input_len, "reserved current_bs");
        Ok(())
    }

    /// Applies a worker's load report, under `L`. Any field that would go
    /// negative is a fatal accounting bug and is surfaced as
    /// [`Error::Underflow`] without partially applying the report.
    pub fn apply_report(&self, report: LoadReport) -> Result<(), Error> {
        self.check_index(report.replica_id)?;
        let mut counters = self.lock()?;
        let i = report.replica_id;

        let next_bs = counters.current_bs[i] + report.delta_current_bs;
        if next_bs < 0 {
            return Err(Error::Underflow {
                index: i,
                field: "current_bs",
                value: counters.current_bs[i],
                delta: report.delta_current_bs,
            });
        }
        let next_kv = counters.available_kv_cache[i] + report.delta_available_kv_cache;
        if next_kv < 0 {
            return Err(Error::Underflow {
                index: i,
                field: "available_kv_cache",
                value: counters.available_kv_cache[i],
                delta: report.delta_available_kv_cache,
            });
        }
        let next_reqs = counters.num_reqs[i] + report.delta_num_reqs;
        if next_reqs < 0 {
            return Err(Error::Underflow {
                index: i,
                field: "num_reqs",
                value: counters.num_reqs[i],
                delta: report.delta_num_reqs,
            });
        }

        counters.current_bs[i] = next_bs;
        counters.available_kv_cache[i] = next_kv;
        counters.num_reqs[i] = next_reqs;
        tracing::trace!(replica_id = i, ?report, "applied load report");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_increments_current_bs_only() {
        let block = LoadBlock::new(2, 1000);
        block.reserve(0, 200).unwrap();
        let snap = block.read_snapshot().unwrap();
        assert_eq!(snap.current_bs, vec![200, 0]);
        assert_eq!(snap.available_kv_cache, vec![1000, 1000]);
    }

    #[test]
    fn reserve_rejects_out_of_range_index() {
        let block = LoadBlock::new(1, 100);
        let err = block.reserve(5, 10).unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { index: 5, num_replicas: 1 }));
    }

    #[test]
    fn apply_report_updates_all_three_fields() {
        let block = LoadBlock::new(1, 500);
        block.reserve(0, 300).unwrap();
        block
            .apply_report(LoadReport {
                replica_id: 0,
                delta_current_bs: -300,
                delta_available_kv_cache: -50,
                delta_num_reqs: 1,
            })
            .unwrap();
        let snap = block.read_snapshot().unwrap();
        assert_eq!(snap.current_bs, vec![0]);
        assert_eq!(snap.available_kv_cache, vec![450]);
        assert_eq!(snap.num_reqs, vec![1]);
    }

    #[test]
    fn apply_report_rejects_underflow_without_partial_mutation() {
        let block = LoadBlock::new(1, 500);
        let err = block
            .apply_report(LoadReport {
                replica_id: 0,
                delta_current_bs: -1,
                delta_available_kv_cache: 0,
                delta_num_reqs: 0,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Underflow { field: "current_bs", .. }));
        // Nothing was applied, not even the fields checked after the failure.
        let snap = block.read_snapshot().unwrap();
        assert_eq!(snap.current_bs, vec![0]);
    }

    #[tokio::test]
    async fn concurrent_reserves_are_serialized_by_the_mutex() {
        let block = LoadBlock::new(1, 10_000);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let block = block.clone();
            handles.push(tokio::spawn(async move { block.reserve(0, 10).unwrap() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let snap = block.read_snapshot().unwrap();
        assert_eq!(snap.current_bs[0], 500);
    }
}
