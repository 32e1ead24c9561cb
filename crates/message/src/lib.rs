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

//! Wire types carried between the tokenizer front-end, the dispatcher, and the
//! replica workers. A [`Dispatchable`] is either a [`Request`] waiting to be
//! routed by a policy, or an [`Abort`] that has taken over a request's slot in
//! the current batch (see the intake multiplexer's replacement rule).

use serde::{Deserialize, Serialize};

/// An already-tokenized generation request submitted by a tokenizer
/// front-end.
///
/// The dispatcher never inspects `input_ids` beyond its length, which is used
/// as the cost proxy by the `RESOURCES_AWARE` policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    /// Opaque request id, used to correlate a later `Abort`.
    pub rid: String,
    /// Tokenized input. Values are opaque to the dispatcher.
    pub input_ids: Vec<i64>,
}

impl Request {
    /// Creates a new request.
    pub fn new(rid: impl Into<String>, input_ids: Vec<i64>) -> Self {
        Self {
            rid: rid.into(),
            input_ids,
        }
    }

    /// Number of tokens in this request, used as the cost proxy by
    /// `RESOURCES_AWARE`.
    pub fn input_len(&self) -> i64 {
        self.input_ids.len() as i64
    }
}

/// A request cancellation. Carries no payload beyond the `rid` it targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Abort {
    /// The id of the request being cancelled.
    pub rid: String,
}

impl Abort {
    /// Creates a new abort for the given request id.
    pub fn new(rid: impl Into<String>) -> Self {
        Self { rid: rid.into() }
    }
}

/// A message received on the intake socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[non_exhaustive]
pub enum IntakeMessage {
    /// A dispatchable generation request.
    Request(Request),
    /// Instructs every replica to flush its KV cache.
    FlushCache,
    /// Cancels a request, in-batch or broadcast (see the multiplexer).
    Abort(Abort),
}

impl IntakeMessage {
    /// Returns the name of this message's kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            IntakeMessage::Request(_) => "request",
            IntakeMessage::FlushCache => "flush_cache",
            IntakeMessage::Abort(_) => "abort",
        }
    }
}

/// An item that occupies a slot in a dispatch batch.
///
/// Built from the dispatchable requests the multiplexer collected, with any
/// in-batch `Abort` already substituted for the request it cancels (§4.C).
/// This is the unit the policies operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Dispatchable {
    /// A generation request to route to exactly one replica.
    Request(Request),
    /// An abort that has taken over a request's batch slot; routed the same
    /// way a request would be, but carries no token cost.
    Abort(Abort),
}

impl Dispatchable {
    /// The request id this item carries, for `Abort`-replacement matching.
    pub fn rid(&self) -> &str {
        match self {
            Dispatchable::Request(req) => &req.rid,
            Dispatchable::Abort(abort) => &abort.rid,
        }
    }

    /// Token cost used by `RESOURCES_AWARE`; zero for an `Abort`.
    pub fn input_len(&self) -> i64 {
        match self {
            Dispatchable::Request(req) => req.input_len(),
            Dispatchable::Abort(_) => 0,
        }
    }
}

/// A message forwarded to a single replica's ingress queue.
///
/// This is the wire representation used on the per-replica transport: the
/// same three kinds as [`IntakeMessage`], but with `Request` already narrowed
/// to a routed [`Dispatchable`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EgressMessage {
    /// A routed dispatchable item.
    Item(Dispatchable),
    /// A cache-flush control message.
    FlushCache,
}

impl EgressMessage {
    /// Returns the name of this message's kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EgressMessage::Item(Dispatchable::Request(_)) => "request",
            EgressMessage::Item(Dispatchable::Abort(_)) => "abort",
            EgressMessage::FlushCache => "flush_cache",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_input_len_matches_token_count() {
        let req = Request::new("r0", vec![1, 2, 3, 4]);
        assert_eq!(req.input_len(), 4);
    }

    #[test]
    fn abort_has_zero_cost_as_a_dispatchable() {
        let item = Dispatchable::Abort(Abort::new("r0"));
        assert_eq!(item.input_len(), 0);
        assert_eq!(item.rid(), "r0");
    }

    #[test]
    fn intake_message_roundtrips_through_json() {
        let msg = IntakeMessage::Request(Request::new("r1", vec![9, 9]));
        let encoded = serde_json::to_string(&msg).expect("encode");
        let decoded: IntakeMessage = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.kind(), "request");
    }
}
