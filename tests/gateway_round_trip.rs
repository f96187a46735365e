//! End-to-end: a client connects to a bound gateway, sends a framed request,
//! and gets back a correlated reply without going through any dispatcher
//! internals directly.

use std::sync::Arc;
use std::time::Duration;

use agentcore::core::dispatcher::{CancellationHandle, Dispatcher, MethodHandler};
use agentcore::core::gateway::Gateway;
use agentcore::core::wire::{read_frame, write_frame};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::TcpStream;

struct AddOne;

#[async_trait]
impl MethodHandler for AddOne {
    async fn handle(&self, params: Value, _c: CancellationHandle) -> Result<Value, String> {
        let n = params.get("n").and_then(Value::as_i64).ok_or("missing n")?;
        Ok(json!({ "n": n + 1 }))
    }
}

#[tokio::test]
async fn round_trip_through_a_bound_socket() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher
        .register("add_one", Arc::new(AddOne), Duration::from_secs(5))
        .await
        .unwrap();
    dispatcher.seal();

    let gateway = Arc::new(Gateway::new(dispatcher, 64 * 1024));
    let addr = gateway.serve("127.0.0.1:0").await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    write_frame(
        &mut client,
        &json!({ "correlation_id": null, "method": "add_one", "params": { "n": 41 } }),
    )
    .await
    .unwrap();

    let reply: Value = read_frame(&mut client, 64 * 1024).await.unwrap();
    assert_eq!(reply["result"]["n"], 42);
    assert!(reply["error"].is_null());
}

#[tokio::test]
async fn two_requests_on_the_same_connection_each_get_their_own_reply() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher
        .register("add_one", Arc::new(AddOne), Duration::from_secs(5))
        .await
        .unwrap();
    dispatcher.seal();

    let gateway = Arc::new(Gateway::new(dispatcher, 64 * 1024));
    let addr = gateway.serve("127.0.0.1:0").await.unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();

    for n in [1, 2] {
        write_frame(
            &mut client,
            &json!({ "correlation_id": null, "method": "add_one", "params": { "n": n } }),
        )
        .await
        .unwrap();
        let reply: Value = read_frame(&mut client, 64 * 1024).await.unwrap();
        assert_eq!(reply["result"]["n"], n + 1);
    }
}
