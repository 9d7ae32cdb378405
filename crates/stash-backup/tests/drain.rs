//! Tests for waiting on the server to drain
//!

use core::time::Duration;

use common::{FakeServer, drained, draining};
use serde_json::json;
use stash_backup::{
    LockToken,
    cancellation::{Cancellation, Deadline},
    context::Context,
    drain::{DrainError, wait_for_drain},
};

mod common;

fn wait(
    server: &FakeServer,
    deadline: Deadline,
    cancellation: &Cancellation,
) -> Result<u32, DrainError> {
    wait_for_drain(
        &Context::new("http://stash:7990/"),
        server,
        &LockToken::new("T1"),
        Duration::ZERO,
        &deadline,
        cancellation,
    )
}

#[test]
fn stops_on_first_drained_poll() {
    let server = FakeServer::new();
    server.state().statuses = [draining(), drained()].into();

    let polls = wait(&server, Deadline::after(None), &Cancellation::new()).unwrap();

    assert_eq!(polls, 2);
    assert_eq!(server.status_polls(), 2);
}

#[test]
fn both_states_must_drain_on_the_same_poll() {
    let server = FakeServer::new();
    server.state().statuses = [
        json!({ "db-state": "DRAINED", "scm-state": "DRAINING" }),
        json!({ "db-state": "DRAINING", "scm-state": "DRAINED" }),
        json!({ "db-state": " drained ", "scm-state": "\"Drained\"" }),
    ]
    .into();

    let polls = wait(&server, Deadline::after(None), &Cancellation::new()).unwrap();

    assert_eq!(polls, 3);
}

#[test]
fn times_out() {
    let server = FakeServer::new();
    server.state().statuses = [draining()].into();

    let result = wait(
        &server,
        Deadline::after(Some(Duration::from_millis(20))),
        &Cancellation::new(),
    );

    assert!(matches!(result, Err(DrainError::Timeout(_))));
    assert!(server.status_polls() >= 1);
}

#[test]
fn cancellation_stops_polling() {
    let server = FakeServer::new();
    server.state().statuses = [draining()].into();
    let cancellation = Cancellation::new();
    cancellation.cancel();

    let result = wait(&server, Deadline::after(None), &cancellation);

    assert!(matches!(result, Err(DrainError::Cancelled)));
    assert_eq!(server.status_polls(), 0);
}
