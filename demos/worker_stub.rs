//! A minimal stand-in for the out-of-scope "replica worker" contract (spec.md
//! §1). Used by `dispatcher_demo` and the integration tests to smoke-test the
//! dispatcher against a real child process without a real model runtime.
//!
//! On start-up it performs the init handshake `worker::WorkerTable::spawn`
//! expects (a single `init ok` line on stdout), then alternates between:
//! reading `message::EgressMessage` frames off stdin (what the dispatcher
//! routed to it) and writing a `shared_load::LoadReport` to stdout after
//! "completing" each request, exactly as `original_source/controller_flex.py`'s
//! worker processes report back to `ControllerInfo` on completion.

use std::io::{self, BufRead, Write};

use message::{Dispatchable, EgressMessage};
use shared_load::LoadReport;

fn main() {
    let replica_id = parse_replica_id();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "init ok").expect("write init handshake");
    out.flush().expect("flush init handshake");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: EgressMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(error) => {
                eprintln!("worker_stub[{replica_id}]: malformed egress message: {error}");
                continue;
            }
        };

        match message {
            EgressMessage::FlushCache => {
                eprintln!("worker_stub[{replica_id}]: flushing cache");
            }
            EgressMessage::Item(Dispatchable::Abort(abort)) => {
                eprintln!("worker_stub[{replica_id}]: aborting rid={}", abort.rid);
            }
            EgressMessage::Item(Dispatchable::Request(request)) => {
                // Simulates admission immediately followed by completion: the
                // dispatcher's `current_bs` reservation is released, and the
                // transient KV-cache/`num_reqs` usage nets to zero.
                let report = LoadReport {
                    replica_id,
                    delta_current_bs: -request.input_len(),
                    delta_available_kv_cache: 0,
                    delta_num_reqs: 0,
                };
                let encoded = serde_json::to_string(&report).expect("encode load report");
                writeln!(out, "{encoded}").expect("write load report");
                out.flush().expect("flush load report");
            }
        }
    }
}

fn parse_replica_id() -> usize {
    std::env::args()
        .find_map(|arg| arg.strip_prefix("--replica-id=").map(str::to_string))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}
