//! RPC channel behavior against a scripted server: call multiplexing,
//! event routing and termination semantics.

mod common;

use common::{FakeServer, Reply, Responder, unwrap_arg, wait_until};
use remdap::error::Error;
use remdap::remote::proto::{RemoteEvent, RemoteEventKind, RemoteFn};
use remdap::remote::wire::{Frame, STATUS_OK};
use remdap::remote::{Credentials, RemoteClient};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

fn credentials() -> Credentials {
    Credentials {
        user: "tester".to_string(),
        password: "secret".to_string(),
    }
}

fn silent_after_login() -> Responder {
    Arc::new(|func, _| {
        if func == "login" {
            Reply::Ok(Value::Null)
        } else {
            Reply::Silent
        }
    })
}

async fn connected_client(server: &FakeServer) -> RemoteClient {
    let client = RemoteClient::new(|_| {});
    client.connect(&server.addr, &credentials()).await.unwrap();
    client
}

fn response(id: u64, data: Value) -> Frame {
    Frame {
        id: Some(id),
        func: None,
        event: None,
        data,
        message: STATUS_OK.to_string(),
    }
}

#[tokio::test]
async fn connect_performs_bare_login() {
    let server = FakeServer::spawn(silent_after_login()).await;
    connected_client(&server).await;

    let logins = server.calls_named("login");
    assert_eq!(logins.len(), 1);
    // Login is the one call that bypasses the value-object wrapping.
    assert_eq!(logins[0].data, json!(["tester", "secret"]));
}

#[tokio::test]
async fn connect_is_idempotent() {
    let server = FakeServer::spawn(silent_after_login()).await;
    let client = connected_client(&server).await;
    client.connect(&server.addr, &credentials()).await.unwrap();

    assert_eq!(server.calls_named("login").len(), 1);
}

#[tokio::test]
async fn concurrent_calls_resolve_out_of_order_without_cross_wiring() {
    let server = FakeServer::spawn(silent_after_login()).await;
    let client = Arc::new(connected_client(&server).await);

    let tasks: Vec<_> = (0..3)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move {
                let result = client
                    .call(RemoteFn::GetVariable, json!({ "n": n }))
                    .await
                    .unwrap();
                (n, result)
            })
        })
        .collect();

    let calls = server.wait_for_calls("getVariable", 3).await;
    // Answer in reverse send order; every caller must still get its own
    // payload back.
    for call in calls.iter().rev() {
        let echoed = unwrap_arg(&call.data, "n");
        server.send_raw(response(call.id, json!({ "n": echoed }))).await;
    }

    for task in tasks {
        let (n, result) = task.await.unwrap();
        // Scalars cross the value model as numbers; compare numerically.
        assert_eq!(
            result["n"].as_f64(),
            Some(f64::from(n)),
            "response cross-wired for call {n}"
        );
    }
}

#[tokio::test]
async fn failed_call_is_isolated() {
    let server = FakeServer::spawn(Arc::new(|func, _| match func {
        "login" => Reply::Ok(Value::Null),
        "stepOver" => Reply::Fail("not paused".to_string()),
        _ => Reply::Ok(json!({})),
    }))
    .await;
    let client = connected_client(&server).await;

    let err = client
        .call(RemoteFn::StepOver, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RemoteFailure(func, status)
        if func == "stepOver" && status == "not paused"));

    // The channel survives; the next call is unaffected.
    client
        .call(RemoteFn::GetStackVariables, json!({"frame": 1}))
        .await
        .unwrap();
}

#[tokio::test]
async fn calls_after_terminate_never_touch_the_wire() {
    let server = FakeServer::spawn(silent_after_login()).await;
    let client = connected_client(&server).await;
    client.terminate().await;

    let before = server.calls().len();
    let result = client.call(RemoteFn::PauseRun, json!({})).await.unwrap();
    assert_eq!(result, Value::Null);
    assert_eq!(server.calls().len(), before);
}

#[tokio::test]
async fn pending_calls_are_rejected_at_teardown() {
    let server = FakeServer::spawn(silent_after_login()).await;
    let client = Arc::new(connected_client(&server).await);

    let in_flight = tokio::spawn({
        let client = client.clone();
        async move { client.call(RemoteFn::StackTrace, json!({})).await }
    });
    server.wait_for_calls("stackTrace", 1).await;
    client.terminate().await;

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ChannelClosed));
}

#[tokio::test]
async fn non_ok_event_goes_to_error_callback_not_handler() {
    let server = FakeServer::spawn(silent_after_login()).await;
    let errors: Arc<Mutex<Vec<String>>> = Arc::default();
    let client = RemoteClient::new({
        let errors = errors.clone();
        move |e| errors.lock().unwrap().push(e.to_string())
    });
    client.connect(&server.addr, &credentials()).await.unwrap();

    let outputs: Arc<Mutex<Vec<String>>> = Arc::default();
    client.on(RemoteEventKind::Output, {
        let outputs = outputs.clone();
        move |event| {
            if let RemoteEvent::Output(chunk) = event {
                outputs.lock().unwrap().push(chunk.data);
            }
        }
    });

    server
        .emit_with_status("OUTPUT", json!("lost"), "stream broken")
        .await;
    wait_until(|| !errors.lock().unwrap().is_empty(), "error callback").await;
    assert!(outputs.lock().unwrap().is_empty());

    // ERROR is one of the two events that legitimately carry a failure
    // status; it must reach the handler.
    let exceptions: Arc<Mutex<Vec<String>>> = Arc::default();
    client.on(RemoteEventKind::Error, {
        let exceptions = exceptions.clone();
        move |event| {
            if let RemoteEvent::Error(exc) = event {
                exceptions.lock().unwrap().push(exc.description);
            }
        }
    });
    server
        .emit_with_status("ERROR", json!({"description": "boom"}), "runtime failure")
        .await;
    wait_until(|| !exceptions.lock().unwrap().is_empty(), "exception handler").await;
    assert_eq!(exceptions.lock().unwrap()[0], "boom");
}

#[tokio::test]
async fn registering_a_handler_twice_replaces_it() {
    let server = FakeServer::spawn(silent_after_login()).await;
    let client = connected_client(&server).await;

    let first: Arc<Mutex<Vec<String>>> = Arc::default();
    let second: Arc<Mutex<Vec<String>>> = Arc::default();
    client.on(RemoteEventKind::Output, {
        let first = first.clone();
        move |_| first.lock().unwrap().push("first".to_string())
    });
    client.on(RemoteEventKind::Output, {
        let second = second.clone();
        move |_| second.lock().unwrap().push("second".to_string())
    });

    server.emit("OUTPUT", json!("hello")).await;
    wait_until(|| !second.lock().unwrap().is_empty(), "replacement handler").await;
    assert!(first.lock().unwrap().is_empty());
}
