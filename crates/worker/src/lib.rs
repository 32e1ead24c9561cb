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

//! The worker handle table: spawning replica control processes, performing
//! their init handshake, and exposing their ingress queues to the policies.
//!
//! `original_source/controller_flex.py`'s `start_dp_worker` spawns a
//! `multiprocessing.Process` per replica, blocks on a `multiprocessing.Pipe`
//! until it reads the literal string `"init ok"`, and hands the worker a
//! `multiprocessing.Queue` as its ingress. This crate spawns a real child
//! process via `tokio::process::Command` and keeps the same two contracts:
//! the child's piped `stdout` is the unidirectional init-status channel (one
//! line, `init ok` or a failure description), and after that handshake the
//! same stream doubles as the load-observability channel the spec's §1
//! mentions — subsequent lines are JSON-encoded [`shared_load::LoadReport`]s
//! the dispatcher folds into its [`shared_load::LoadBlock`].
//!
//! The ingress queue itself is a `flume::unbounded` channel (SPSC in
//! practice: the dispatcher is the only producer, a single per-replica
//! forwarding task is the only consumer), whose `len()` is what
//! `SHORTEST_QUEUE` queries as "queue depth" — the same cheap, non-blocking
//! interrogation `multiprocessing.Queue.qsize()` gave the original a
//! continent away. A forwarding task drains it onto the child's piped
//! `stdin`, which is what actually crosses the process boundary.

use std::process::Stdio;

use message::EgressMessage;
use shared_load::LoadBlock;
use task::{
    labels::{ProcessLabels, TaskLabels},
    TaskManager,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
};

/// Errors raised while spawning or driving replica workers.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The worker process could not be spawned.
    #[error("failed to spawn worker process for replica {replica_id} (command: {command}, reason: {reason})")]
    Spawn {
        /// The replica that failed to spawn.
        replica_id: usize,
        /// The command that was run.
        command: String,
        /// The underlying I/O error.
        reason: String,
    },

    /// The worker did not report `"init ok"` on its init channel.
    #[error("worker initialization failed for replica {replica_id} (reported: {reported})")]
    Init {
        /// The replica whose init handshake failed.
        replica_id: usize,
        /// The message the worker reported instead of `"init ok"`.
        reported: String,
    },

    /// Enqueuing a message to a worker's ingress queue failed. Assumed
    /// infallible within the lifetime of the dispatcher (§4.F); a failure
    /// here is always fatal to the caller.
    #[error("failed to enqueue message to replica {replica_id} (reason: {reason})")]
    Enqueue {
        /// The replica the enqueue was targeting.
        replica_id: usize,
        /// The underlying channel error.
        reason: String,
    },

    /// A replica id was outside `[0, N)`.
    #[error("replica id {replica_id} out of range (num_replicas: {num_replicas})")]
    UnknownReplica {
        /// The offending replica id.
        replica_id: usize,
        /// The size of the worker handle table.
        num_replicas: usize,
    },
}

const INIT_OK: &str = "init ok";

/// The handle of a single replica worker: its ingress queue and the OS
/// process backing it.
pub struct WorkerHandle {
    replica_id: usize,
    ingress: flume::Sender<EgressMessage>,
    child_pid: Option<i32>,
    /// Keeps a test-only receiver alive for the lifetime of the handle. The
    /// real `spawn` path hands its receiver to the forwarding task instead
    /// (that task is the actual consumer), so this is `None` there. Never
    /// read; its purpose is to stay alive so `ingress.send` doesn't see a
    /// disconnected channel.
    #[allow(dead_code)]
    test_receiver: Option<flume::Receiver<EgressMessage>>,
}

impl WorkerHandle {
    /// The replica id this handle was allocated for.
    pub fn replica_id(&self) -> usize {
        self.replica_id
    }

    /// The current depth of this replica's ingress queue — cheap and
    /// non-blocking, as `SHORTEST_QUEUE` requires (§4.F.2).
    pub fn depth(&self) -> usize {
        self.ingress.len()
    }

    /// Enqueues a message to this replica. Order of enqueue is order of
    /// consumption (FIFO, §3).
    pub fn enqueue(&self, message: EgressMessage) -> Result<(), Error> {
        self.ingress.send(message).map_err(|err| Error::Enqueue {
            replica_id: self.replica_id,
            reason: err.to_string(),
        })
    }

    /// Builds a handle with no backing process, for tests (including
    /// downstream crates) that need a [`WorkerTable`] without spawning real
    /// workers. `depth` messages are pre-queued so [`WorkerHandle::depth`]
    /// starts at that value. The receiver is kept alive on the handle itself
    /// (there is no forwarding task to own it in tests), so subsequent
    /// enqueues don't fail with the channel appearing disconnected.
    #[doc(hidden)]
    pub fn for_testing(replica_id: usize, depth: usize) -> Self {
        let (ingress, receiver) = flume::unbounded();
        for _ in 0..depth {
            ingress
                .send(EgressMessage::FlushCache)
                .expect("freshly created channel has room");
        }
        Self {
            replica_id,
            ingress,
            child_pid: None,
            test_receiver: Some(receiver),
        }
    }
}

/// An ordered table of `N` worker handles, `replica_id == index`, fixed for
/// the dispatcher's entire lifetime (§3 invariant).
pub struct WorkerTable {
    handles: Vec<WorkerHandle>,
}

impl WorkerTable {
    /// Spawns `num_replicas` worker processes, one per replica, each
    /// assigned the contiguous accelerator range `[i*tp_size,
    /// (i+1)*tp_size)`. Blocks on each worker's init handshake in turn,
    /// exactly as `controller_flex.py` does (one `recv()` per
    /// `start_dp_worker` call) — appending a handle to the table only after
    /// a successful init, so `replica_id == index` holds from the first
    /// entry onward.
    pub async fn spawn(
        worker_command: &str,
        num_replicas: usize,
        tp_size: usize,
        load_block: LoadBlock,
        process_labels: ProcessLabels,
        mut task_manager: TaskManager,
    ) -> Result<Self, Error> {
        let mut handles = Vec::with_capacity(num_replicas);

        for replica_id in 0..num_replicas {
            let accel_start = replica_id * tp_size;
            let accel_end = (replica_id + 1) * tp_size;

            let mut child = Command::new(worker_command)
                .arg(format!("--replica-id={replica_id}"))
                .arg(format!("--accel-ids={accel_start}-{}", accel_end - 1))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| Error::Spawn {
                    replica_id,
                    command: worker_command.to_string(),
                    reason: err.to_string(),
                })?;

            let mut stdout = BufReader::new(child.stdout.take().expect("piped stdout")).lines();
            let reported = stdout
                .next_line()
                .await
                .map_err(|err| Error::Init {
                    replica_id,
                    reported: err.to_string(),
                })?
                .unwrap_or_default();
            if reported != INIT_OK {
                return Err(Error::Init { replica_id, reported });
            }
            tracing::info!(replica_id, "worker initialized");

            let child_pid = child.id().map(|pid| pid as i32);
            let stdin = child.stdin.take().expect("piped stdin");
            let (sender, receiver) = flume::unbounded();

            spawn_forwarding_task(replica_id, receiver, stdin, process_labels.clone(), &mut task_manager);
            spawn_report_task(replica_id, stdout, load_block.clone(), process_labels.clone(), &mut task_manager);
            spawn_reaper_task(replica_id, child, process_labels.clone(), &mut task_manager);

            handles.push(WorkerHandle {
                replica_id,
                ingress: sender,
                child_pid,
                test_receiver: None,
            });
        }

        Ok(Self { handles })
    }

    /// Builds a worker table directly from handles, for tests that don't
    /// spawn real processes.
    #[doc(hidden)]
    pub fn from_handles(handles: Vec<WorkerHandle>) -> Self {
        Self { handles }
    }

    /// The number of replicas in this table.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether this table has no replicas.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// The current ingress-queue depth of every replica, in order.
    pub fn depths(&self) -> Vec<usize> {
        self.handles.iter().map(WorkerHandle::depth).collect()
    }

    /// Enqueues `message` to replica `replica_id`.
    pub fn enqueue(&self, replica_id: usize, message: EgressMessage) -> Result<(), Error> {
        self.handles
            .get(replica_id)
            .ok_or(Error::UnknownReplica {
                replica_id,
                num_replicas: self.handles.len(),
            })?
            .enqueue(message)
    }

    /// Forwards `message` to every replica's ingress queue.
    pub fn broadcast(&self, message: EgressMessage) {
        for handle in &self.handles {
            if let Err(error) = handle.enqueue(message.clone()) {
                tracing::error!(%error, replica_id = handle.replica_id, "broadcast enqueue failed");
            }
        }
    }

    /// Sends `SIGKILL` to every worker process. Called on an unrecoverable
    /// dispatcher-loop error (§4.E); never retried.
    pub fn kill_all(&self) {
        for handle in &self.handles {
            let Some(pid) = handle.child_pid else { continue };
            tracing::warn!(replica_id = handle.replica_id, pid, "sending SIGKILL to worker");
            if let Err(error) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::SIGKILL) {
                tracing::error!(%error, replica_id = handle.replica_id, pid, "SIGKILL delivery failed");
            }
        }
    }
}

fn spawn_forwarding_task(
    replica_id: usize,
    receiver: flume::Receiver<EgressMessage>,
    mut stdin: tokio::process::ChildStdin,
    process_labels: ProcessLabels,
    task_manager: &mut TaskManager,
) {
    let task_labels = TaskLabels {
        task_cat: "worker-egress".into(),
        task_id: format!("worker-egress/{replica_id}"),
        task_source: "dispatcher".into(),
    };
    let task_labels_clone = task_labels.clone();
    let process_labels_clone = process_labels.clone();

    let join_handle = tokio::task::spawn(async move {
        while let Ok(message) = receiver.recv_async().await {
            let encoded = match serde_json::to_string(&message) {
                Ok(encoded) => encoded,
                Err(error) => {
                    tracing::error!(%error, replica_id, "failed to encode egress message");
                    continue;
                }
            };
            if let Err(error) = stdin.write_all(encoded.as_bytes()).await {
                tracing::error!(%error, replica_id, "failed to write to worker stdin");
                break;
            }
            if let Err(error) = stdin.write_all(b"\n").await {
                tracing::error!(%error, replica_id, "failed to write newline to worker stdin");
                break;
            }
        }
        TaskManager::no_task_cleaner(process_labels_clone, task_labels_clone)
    });
    task_manager.register(join_handle, &task_labels);
}

fn spawn_report_task(
    replica_id: usize,
    mut stdout: tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    load_block: LoadBlock,
    process_labels: ProcessLabels,
    task_manager: &mut TaskManager,
) {
    let task_labels = TaskLabels {
        task_cat: "worker-load-report".into(),
        task_id: format!("worker-load-report/{replica_id}"),
        task_source: "worker".into(),
    };
    let task_labels_clone = task_labels.clone();
    let process_labels_clone = process_labels.clone();

    let join_handle = tokio::task::spawn(async move {
        loop {
            let line = match stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(%error, replica_id, "reading worker load report failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<shared_load::LoadReport>(&line) {
                Ok(report) => {
                    if let Err(error) = load_block.apply_report(report) {
                        tracing::error!(%error, replica_id, "fatal accounting error applying load report");
                    }
                }
                Err(error) => {
                    tracing::error!(%error, %line, replica_id, "malformed load report, discarding");
                }
            }
        }
        TaskManager::no_task_cleaner(process_labels_clone, task_labels_clone)
    });
    task_manager.register(join_handle, &task_labels);
}

fn spawn_reaper_task(
    replica_id: usize,
    mut child: Child,
    process_labels: ProcessLabels,
    task_manager: &mut TaskManager,
) {
    let task_labels = TaskLabels {
        task_cat: "worker-process".into(),
        task_id: format!("worker-process/{replica_id}"),
        task_source: "os".into(),
    };
    let task_labels_clone = task_labels.clone();
    let process_labels_clone = process_labels.clone();

    let join_handle = tokio::task::spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::info!(replica_id, %status, "worker process exited"),
            Err(error) => tracing::error!(%error, replica_id, "failed to wait on worker process"),
        }
        TaskManager::no_task_cleaner(process_labels_clone, task_labels_clone)
    });
    task_manager.register(join_handle, &task_labels);
}

#[cfg(test)]
mod tests {
    use message::{Dispatchable, Request};

    use super::*;

    fn table_with(depths: &[usize]) -> WorkerTable {
        let handles = depths
            .iter()
            .enumerate()
            .map(|(replica_id, &depth)| {
                let (sender, receiver) = flume::unbounded();
                for _ in 0..depth {
                    sender
                        .send(EgressMessage::Item(Dispatchable::Request(Request::new("x", vec![1]))))
                        .expect("prime depth");
                }
                WorkerHandle {
                    replica_id,
                    ingress: sender,
                    child_pid: None,
                    test_receiver: Some(receiver),
                }
            })
            .collect();
        WorkerTable::from_handles(handles)
    }

    #[test]
    fn depths_reports_unconsumed_queue_length() {
        let table = table_with(&[4, 1, 2]);
        assert_eq!(table.depths(), vec![4, 1, 2]);
    }

    #[test]
    fn enqueue_targets_exactly_one_replica() {
        let table = table_with(&[0, 0]);
        table
            .enqueue(1, EgressMessage::Item(Dispatchable::Request(Request::new("r", vec![1]))))
            .unwrap();
        assert_eq!(table.depths(), vec![0, 1]);
    }

    #[test]
    fn enqueue_rejects_out_of_range_replica() {
        let table = table_with(&[0]);
        let err = table.enqueue(7, EgressMessage::FlushCache).unwrap_err();
        assert!(matches!(err, Error::UnknownReplica { replica_id: 7, num_replicas: 1 }));
    }

    #[test]
    fn broadcast_reaches_every_replica_exactly_once() {
        let table = table_with(&[0, 0, 0]);
        table.broadcast(EgressMessage::FlushCache);
        assert_eq!(table.depths(), vec![1, 1, 1]);
    }
}
