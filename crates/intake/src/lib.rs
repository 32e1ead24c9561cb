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

//! The intake multiplexer: a non-blocking drain of the intake socket into a
//! dispatch batch, with `FlushCache`/`Abort` control messages peeled off and
//! forwarded to the replicas as they are seen.
//!
//! Bound to `tcp://127.0.0.1:<controller_port>` (spec §6), this accepts
//! connections from tokenizer front-ends and reads newline-delimited JSON
//! frames off each one, exactly as `controller_flex.py`'s
//! `recv_from_tokenizer` PULL socket does for its `recv_pyobj(zmq.NOBLOCK)`
//! loop — a background task does the actual reading, and
//! [`Multiplexer::drain`] only ever pulls from an in-process channel, so it
//! never blocks on the socket itself (§5).

use std::{net::SocketAddr, sync::Arc};

use message::{Abort, Dispatchable, EgressMessage, IntakeMessage};
use task::{
    labels::{ProcessLabels, TaskLabels},
    TaskManager,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
};

/// Errors raised by the intake multiplexer.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The intake socket could not be bound.
    #[error("failed to bind intake socket on {addr} (reason: {reason})")]
    Bind {
        /// The address the multiplexer tried to bind.
        addr: SocketAddr,
        /// The underlying I/O error.
        reason: String,
    },
}

/// Something a [`Multiplexer`] can forward a control message to every
/// replica through. Implemented by `dispatcher` over a `worker::WorkerTable`
/// — kept as a trait here so this crate never needs to depend on the worker
/// process-spawning machinery.
pub trait Broadcaster: Send + Sync {
    /// Forwards `message` to every replica's ingress queue.
    fn broadcast(&self, message: EgressMessage);
}

/// The intake multiplexer.
///
/// Owns the consumer end of an in-process channel fed by a background
/// accept/read task; [`Multiplexer::drain`] is the only method a dispatcher
/// loop calls, once per iteration.
pub struct Multiplexer {
    inbox: flume::Receiver<IntakeMessage>,
}

impl Multiplexer {
    /// Binds the intake socket and spawns the background task that reads
    /// connections into an internal channel, registering it with
    /// `task_manager` the same way the teacher's receivers are registered.
    pub async fn bind(
        addr: SocketAddr,
        process_labels: ProcessLabels,
        mut task_manager: TaskManager,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await.map_err(|err| Error::Bind {
            addr,
            reason: err.to_string(),
        })?;

        let (sender, inbox) = flume::unbounded();
        let task_labels = TaskLabels {
            task_cat: "intake".into(),
            task_id: format!("intake/{addr}"),
            task_source: "tokenizer".into(),
        };
        let task_labels_clone = task_labels.clone();
        let process_labels_clone = process_labels.clone();

        let join_handle = tokio::task::spawn(async move {
            accept_loop(listener, sender, &task_labels_clone, &process_labels_clone).await;
            TaskManager::no_task_cleaner(process_labels_clone, task_labels_clone)
        });
        task_manager.register(join_handle, &task_labels);

        tracing::info!(%addr, "intake socket bound");
        Ok(Self { inbox })
    }

    /// Builds a multiplexer directly from a channel, for use in tests that
    /// don't need a real socket.
    #[doc(hidden)]
    pub fn from_channel(inbox: flume::Receiver<IntakeMessage>) -> Self {
        Self { inbox }
    }

    /// Repeatedly polls the intake channel in non-blocking mode until it
    /// yields no message available, assembling the dispatch batch.
    ///
    /// `FlushCache` is broadcast immediately and never enters the batch. An
    /// `Abort` replaces a same-`rid` request already in the batch if one is
    /// present; otherwise it is broadcast. Returns the assembled batch,
    /// possibly empty.
    pub fn drain(&self, broadcaster: &(impl Broadcaster + ?Sized)) -> Vec<Dispatchable> {
        let mut batch: Vec<Dispatchable> = Vec::new();

        loop {
            let message = match self.inbox.try_recv() {
                Ok(message) => message,
                Err(flume::TryRecvError::Empty) | Err(flume::TryRecvError::Disconnected) => break,
            };

            match message {
                IntakeMessage::Request(request) => batch.push(Dispatchable::Request(request)),
                IntakeMessage::FlushCache => {
                    tracing::debug!("broadcasting flush_cache");
                    broadcaster.broadcast(EgressMessage::FlushCache);
                }
                IntakeMessage::Abort(abort) => self.fold_abort(abort, &mut batch, broadcaster),
            }
        }

        batch
    }

    fn fold_abort(&self, abort: Abort, batch: &mut [Dispatchable], broadcaster: &(impl Broadcaster + ?Sized)) {
        if let Some(slot) = batch.iter_mut().find(|item| item.rid() == abort.rid) {
            tracing::debug!(rid = %abort.rid, "abort replaces pending request in batch");
            *slot = Dispatchable::Abort(abort);
        } else {
            tracing::debug!(rid = %abort.rid, "broadcasting abort, no pending request in batch");
            broadcaster.broadcast(EgressMessage::Item(Dispatchable::Abort(abort)));
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    sender: flume::Sender<IntakeMessage>,
    task_labels: &TaskLabels,
    process_labels: &ProcessLabels,
) {
    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::error!(%error, "failed to accept intake connection");
                continue;
            }
        };

        tracing::debug!(%peer_addr, "tokenizer front-end connected");
        let sender = sender.clone();
        let task_labels = task_labels.clone();
        let process_labels = process_labels.clone();
        let _join_handle = tokio::task::spawn(async move {
            read_connection(socket, &sender, &task_labels, &process_labels).await;
        });
    }
}

async fn read_connection(
    socket: tokio::net::TcpStream,
    sender: &flume::Sender<IntakeMessage>,
    task_labels: &TaskLabels,
    process_labels: &ProcessLabels,
) {
    let mut lines = BufReader::new(socket).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::error!(
                    %error,
                    process_id = %process_labels.process_id,
                    task_id = %task_labels.task_id,
                    "reading intake connection failed"
                );
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<IntakeMessage>(&line) {
            Ok(message) => {
                if sender.send(message).is_err() {
                    tracing::error!("intake channel closed, dropping message");
                    break;
                }
            }
            Err(error) => {
                tracing::error!(%error, %line, "unknown or malformed intake message, discarding");
            }
        }
    }
}

/// A [`Broadcaster`] implementation that simply records every message it was
/// asked to broadcast, for use by tests of [`Multiplexer::drain`] without
/// depending on the `worker` crate.
#[doc(hidden)]
#[derive(Default)]
pub struct RecordingBroadcaster {
    sent: Arc<std::sync::Mutex<Vec<EgressMessage>>>,
}

impl RecordingBroadcaster {
    /// Creates a new empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every message broadcast so far.
    pub fn sent(&self) -> Vec<EgressMessage> {
        self.sent.lock().expect("recording broadcaster mutex poisoned").clone()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, message: EgressMessage) {
        self.sent.lock().expect("recording broadcaster mutex poisoned").push(message);
    }
}

#[cfg(test)]
mod tests {
    use message::Request;

    use super::*;

    fn push(sender: &flume::Sender<IntakeMessage>, message: IntakeMessage) {
        sender.send(message).expect("send to test channel");
    }

    #[test]
    fn flush_cache_is_broadcast_and_never_enters_the_batch() {
        let (sender, receiver) = flume::unbounded();
        push(&sender, IntakeMessage::FlushCache);
        let mux = Multiplexer::from_channel(receiver);
        let broadcaster = RecordingBroadcaster::new();

        let batch = mux.drain(&broadcaster);

        assert!(batch.is_empty());
        assert!(matches!(broadcaster.sent().as_slice(), [EgressMessage::FlushCache]));
    }

    #[test]
    fn abort_replaces_pending_request_in_the_batch_s5() {
        // S5 — intake stream [Req(a), Req(b), Abort(a), Req(c)].
        let (sender, receiver) = flume::unbounded();
        push(&sender, IntakeMessage::Request(Request::new("a", vec![1])));
        push(&sender, IntakeMessage::Request(Request::new("b", vec![1])));
        push(&sender, IntakeMessage::Abort(Abort::new("a")));
        push(&sender, IntakeMessage::Request(Request::new("c", vec![1])));
        let mux = Multiplexer::from_channel(receiver);
        let broadcaster = RecordingBroadcaster::new();

        let batch = mux.drain(&broadcaster);

        assert!(broadcaster.sent().is_empty(), "no broadcast expected when abort matched in-batch");
        assert_eq!(batch.len(), 3);
        assert!(matches!(&batch[0], Dispatchable::Abort(a) if a.rid == "a"));
        assert!(matches!(&batch[1], Dispatchable::Request(r) if r.rid == "b"));
        assert!(matches!(&batch[2], Dispatchable::Request(r) if r.rid == "c"));
    }

    #[test]
    fn abort_broadcasts_when_no_pending_request_matches_s6() {
        // S6 — intake stream [Abort(x)], no matching pending request.
        let (sender, receiver) = flume::unbounded();
        push(&sender, IntakeMessage::Abort(Abort::new("x")));
        let mux = Multiplexer::from_channel(receiver);
        let broadcaster = RecordingBroadcaster::new();

        let batch = mux.drain(&broadcaster);

        assert!(batch.is_empty());
        let sent = broadcaster.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], EgressMessage::Item(Dispatchable::Abort(a)) if a.rid == "x"));
    }

    #[test]
    fn drain_on_an_empty_channel_returns_an_empty_batch() {
        let (_sender, receiver) = flume::unbounded();
        let mux = Multiplexer::from_channel(receiver);
        let broadcaster = RecordingBroadcaster::new();

        assert!(mux.drain(&broadcaster).is_empty());
    }
}
