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
#![warn(unreachable_pub)]

//! The dispatcher loop: the composition root that binds the intake
//! multiplexer, the worker handle table, and a routing policy together and
//! drives them for the lifetime of the process (§4.E).
//!
//! Mirrors the teacher's `create_pipelines` in shape — load configuration,
//! start the downstream stage before the upstream one that feeds it, wire
//! them with channels, register every background task with a
//! [`TaskManager`] — but there is exactly one pipeline here, fixed at
//! compile time, so there is no pipeline registry or `Engine` trait: this
//! crate's `run` is the only entry point.

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use config::DispatcherConfig;
use message::{Dispatchable, EgressMessage};
use policy::Targets;
use shared_load::LoadBlock;
use task::{labels::ProcessLabels, TaskManager};
use tracing::{error, info};
use worker::WorkerTable;

/// Errors that can terminate the dispatcher loop.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The configuration file could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),

    /// The intake multiplexer could not be bound or failed.
    #[error("intake error: {0}")]
    Intake(#[from] intake::Error),

    /// A worker process could not be spawned or initialized.
    #[error("worker error: {0}")]
    Worker(#[from] worker::Error),

    /// The selected policy failed to dispatch a batch.
    #[error("policy error: {0}")]
    Policy(#[from] policy::Error),
}

/// Adapts a [`WorkerTable`] to the trait objects [`intake::Multiplexer`] and
/// [`policy::Policy`] expect, so neither of those crates needs to depend on
/// `worker` directly.
struct WorkerTableAdapter(Arc<WorkerTable>);

impl intake::Broadcaster for WorkerTableAdapter {
    fn broadcast(&self, message: EgressMessage) {
        self.0.broadcast(message);
    }
}

impl policy::Targets for WorkerTableAdapter {
    fn depths(&self) -> Vec<usize> {
        self.0.depths()
    }

    fn enqueue(&self, replica_id: usize, item: Dispatchable) -> Result<(), String> {
        self.0
            .enqueue(replica_id, EgressMessage::Item(item))
            .map_err(|err| err.to_string())
    }
}

/// How long the dispatcher loop sleeps after an empty drain before polling
/// the intake multiplexer again (§4.E step 2, "yield briefly,
/// implementation-defined").
const EMPTY_BATCH_BACKOFF: Duration = Duration::from_millis(1);

/// Loads the configuration at `config_file_path`, spawns the worker table,
/// binds the intake socket, and runs the dispatch loop until an
/// unrecoverable error occurs.
///
/// On such an error this logs the full cause chain and sends `SIGKILL` to
/// every worker process before returning `Err` (§4.E); the caller — the
/// process's `main` — is expected to treat a returned `Err` as fatal and
/// exit non-zero, which is what actually "terminates the parent process
/// group" in a process hierarchy where the dispatcher is the group leader.
/// No restart logic lives here or anywhere downstream of it.
pub async fn run<P: AsRef<Path>>(process_labels: ProcessLabels, config_file_path: P) -> Result<(), Error> {
    let config = DispatcherConfig::load(config_file_path)?;
    let threshold = config::resources_aware_threshold();
    let task_manager = TaskManager::with_process_labels(process_labels.clone());

    info!(
        process_id = %process_labels.process_id,
        dp_size = config.dp_size,
        tp_size = config.tp_size,
        policy = ?config.policy,
        threshold,
        "starting dispatcher"
    );

    let load_block = LoadBlock::new(config.dp_size, config.initial_kv_cache);

    let worker_table = Arc::new(
        WorkerTable::spawn(
            &config.worker_command,
            config.dp_size,
            config.tp_size,
            load_block.clone(),
            process_labels.clone(),
            task_manager.clone(),
        )
        .await?,
    );
    let adapter = WorkerTableAdapter(worker_table.clone());

    let addr: SocketAddr = format!("127.0.0.1:{}", config.controller_port)
        .parse()
        .expect("host/port always form a valid socket address");
    let multiplexer = intake::Multiplexer::bind(addr, process_labels.clone(), task_manager.clone()).await?;

    let policy = policy::Policy::new(config.policy);

    info!(process_id = %process_labels.process_id, "dispatcher ready, entering dispatch loop");

    let result = dispatch_loop(&multiplexer, &adapter, &policy, &load_block, threshold).await;

    if let Err(ref error) = result {
        error!(
            process_id = %process_labels.process_id,
            %error,
            "unrecoverable dispatcher error, sending SIGKILL to all workers"
        );
        worker_table.kill_all();
    }

    result
}

async fn dispatch_loop(
    multiplexer: &intake::Multiplexer,
    adapter: &WorkerTableAdapter,
    policy: &policy::Policy,
    load_block: &LoadBlock,
    threshold: i64,
) -> Result<(), Error> {
    loop {
        let batch = multiplexer.drain(adapter);

        if batch.is_empty() {
            tokio::time::sleep(EMPTY_BATCH_BACKOFF).await;
            continue;
        }

        policy.dispatch(&batch, adapter, load_block, threshold)?;
    }
}

#[cfg(test)]
mod tests {
    use message::{Abort, IntakeMessage, Request};

    use super::*;

    fn table_with_depths(depths: &[usize]) -> Arc<WorkerTable> {
        let handles = depths
            .iter()
            .enumerate()
            .map(|(replica_id, &depth)| worker::WorkerHandle::for_testing(replica_id, depth))
            .collect();
        Arc::new(WorkerTable::from_handles(handles))
    }

    #[test]
    fn drain_then_dispatch_routes_a_batch_round_robin() {
        let worker_table = table_with_depths(&[0, 0]);
        let adapter = WorkerTableAdapter(worker_table.clone());
        let (sender, inbox) = flume::unbounded();
        sender.send(IntakeMessage::Request(Request::new("a", vec![1]))).unwrap();
        sender.send(IntakeMessage::Request(Request::new("b", vec![1]))).unwrap();
        drop(sender);
        let multiplexer = intake::Multiplexer::from_channel(inbox);
        let policy = policy::Policy::new(config::PolicyKind::RoundRobin);
        let load_block = LoadBlock::new(2, 0);

        let batch = multiplexer.drain(&adapter);
        assert_eq!(batch.len(), 2);
        policy.dispatch(&batch, &adapter, &load_block, 100).unwrap();
        assert_eq!(adapter.depths(), vec![1, 1]);
    }

    #[test]
    fn abort_broadcast_reaches_every_worker_through_the_adapter() {
        let worker_table = table_with_depths(&[0, 0, 0]);
        let adapter = WorkerTableAdapter(worker_table);
        intake::Broadcaster::broadcast(&adapter, EgressMessage::Item(message::Dispatchable::Abort(Abort::new("x"))));
        assert_eq!(adapter.depths(), vec![1, 1, 1]);
    }
}
