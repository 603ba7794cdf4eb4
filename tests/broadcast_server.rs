//! End-to-end coverage of the Broadcast Server's socket-facing contract
//! (spec.md §4.8, §6): a connecting subscriber sees a well-formed sentinel
//! frame immediately, newly published ticks follow in order, control
//! messages round-trip through the session channel, and `subscribe` is
//! answered locally without touching the session at all.

use std::sync::Arc;

use arsandbox_core::broadcast::wire::{
    ControlResponse, ControlStatus, PublishedFrame, SubscribeOptions, WireHealth,
};
use arsandbox_core::broadcast::{self, TickSender};
use arsandbox_core::diagnostics::Diagnostics;
use arsandbox_core::pipeline::ElevationGrid;
use arsandbox_core::session::{BroadcastTick, ControlEnvelope};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

fn sentinel(frame_id: u64) -> BroadcastTick {
    BroadcastTick {
        frame_id,
        capture_ts_ns: 0,
        calibration_rev: 0,
        grid: Arc::new(ElevationGrid::all_invalid(4, 3)),
        color: None,
        features: None,
        health: WireHealth {
            depth_present: false,
            primary_color_present: false,
            aux_color_present: false,
            depth_age_ms: None,
            primary_color_age_ms: None,
            aux_color_age_ms: None,
        },
    }
}

async fn read_published_frame(stream: &mut TcpStream) -> PublishedFrame {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    PublishedFrame::decode(&payload).unwrap()
}

/// Reserves an ephemeral port by binding and immediately releasing it; the
/// server binds the same address moments later. Good enough for a local
/// test run, not for anything adversarial.
fn reserve_ephemeral_addr() -> std::net::SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

struct Harness {
    tick_tx: TickSender,
    cancel: CancellationToken,
}

async fn spawn_server(slow_subscriber_limit: u32) -> (std::net::SocketAddr, Harness, tokio::sync::mpsc::UnboundedReceiver<ControlEnvelope>) {
    let addr = reserve_ephemeral_addr();
    let (tick_tx, tick_rx) = broadcast::tick_channel(Arc::new(sentinel(0)));
    let (control_tx, control_rx) = tokio::sync::mpsc::unbounded_channel::<ControlEnvelope>();
    let diagnostics = Arc::new(Diagnostics::new(33, 16));
    let cancel = CancellationToken::new();

    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = broadcast::serve(addr, tick_rx, control_tx, diagnostics, slow_subscriber_limit, serve_cancel).await;
    });
    // Give the accept loop a moment to bind before the test connects.
    tokio::task::yield_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    (addr, Harness { tick_tx, cancel }, control_rx)
}

#[tokio::test]
async fn subscriber_sees_sentinel_then_subsequent_ticks_in_order() {
    let (addr, harness, _control_rx) = spawn_server(300).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let first = read_published_frame(&mut stream).await;
    assert_eq!(first.frame_id, 0);
    assert_eq!(first.width, 4);
    assert_eq!(first.height, 3);

    harness.tick_tx.send(Arc::new(sentinel(1))).unwrap();
    let second = read_published_frame(&mut stream).await;
    assert_eq!(second.frame_id, 1);

    harness.tick_tx.send(Arc::new(sentinel(2))).unwrap();
    let third = read_published_frame(&mut stream).await;
    assert_eq!(third.frame_id, 2);

    harness.cancel.cancel();
}

#[tokio::test]
async fn subscribe_control_op_is_answered_without_reaching_the_session() {
    let (addr, harness, mut control_rx) = spawn_server(300).await;

    // Nothing ever drains `control_rx` in this test; if `subscribe` were
    // forwarded to the session the response would never arrive and this
    // test would hang.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let _ = read_published_frame(&mut stream).await;

    let (read_half, mut write_half) = stream.into_split();
    let options = SubscribeOptions { want_color: true, want_features: false };
    let request = serde_json::json!({"op_id": 1, "op": "subscribe", "options": options});
    write_half.write_all(format!("{}\n", request).as_bytes()).await.unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let line = lines.next_line().await.unwrap().unwrap();
    let response: ControlResponse = serde_json::from_str(&line).unwrap();
    assert_eq!(response.op_id, 1);
    assert_eq!(response.status, ControlStatus::Ok);

    assert!(control_rx.try_recv().is_err());
    harness.cancel.cancel();
}

#[tokio::test]
async fn non_subscribe_control_ops_round_trip_through_the_session_channel() {
    let (addr, harness, mut control_rx) = spawn_server(300).await;

    // Stand in for the session: acknowledge every envelope it receives.
    tokio::spawn(async move {
        while let Some(envelope) = control_rx.recv().await {
            let _ = envelope.respond.send((ControlStatus::Ok, None));
        }
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let _ = read_published_frame(&mut stream).await;

    let (read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(br#"{"op_id": 7, "op": "set_alpha", "value": 0.5}"#)
        .await
        .unwrap();
    write_half.write_all(b"\n").await.unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let line = lines.next_line().await.unwrap().unwrap();
    let response: ControlResponse = serde_json::from_str(&line).unwrap();
    assert_eq!(response.op_id, 7);
    assert_eq!(response.status, ControlStatus::Ok);

    harness.cancel.cancel();
}

#[tokio::test]
async fn malformed_control_lines_get_an_error_response_without_disconnecting() {
    let (addr, harness, _control_rx) = spawn_server(300).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let _ = read_published_frame(&mut stream).await;

    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(b"not json at all\n").await.unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let line = lines.next_line().await.unwrap().unwrap();
    let response: ControlResponse = serde_json::from_str(&line).unwrap();
    assert_eq!(response.status, ControlStatus::Error);

    harness.cancel.cancel();
}
