//! Broadcast Server: accepts persistent push connections, encodes frames,
//! serves subscribers with per-subscriber backpressure, and accepts
//! control messages (spec.md §4.8).
//!
//! Each subscriber connection carries both logical channels named in §6:
//! `frame` (server→client, length-prefixed bincode) and `control`
//! (client→server, newline-delimited JSON). The newest-wins single-slot
//! mailbox (§3, §5) is a `tokio::sync::watch` channel: the session thread
//! holds the lone `Sender` and every subscriber clones a `Receiver`, so a
//! slow reader only ever observes the latest tick and the producer never
//! blocks (see SPEC_FULL.md §E).

pub mod wire;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::session::{BroadcastTick, ControlEnvelope};
use wire::{
    decode_control_request, encode_control_line, ControlOp, ControlRequest, ControlResponse,
    ControlStatus, PublishedFrame, SubscribeOptions,
};

/// Sender half of the tick distribution channel; owned by whatever drives
/// the session's tick loop and cloned nowhere else (spec.md §5: "Broadcast
/// tasks block on socket writes but never on the pipeline").
pub type TickSender = watch::Sender<Arc<BroadcastTick>>;
pub type TickReceiver = watch::Receiver<Arc<BroadcastTick>>;

/// Creates the tick distribution channel, seeded with a sentinel tick so
/// subscribers that connect before the first real tick still see a
/// well-formed (all-invalid) frame rather than blocking indefinitely.
pub fn tick_channel(sentinel: Arc<BroadcastTick>) -> (TickSender, TickReceiver) {
    watch::channel(sentinel)
}

/// Per-connection, atomically-mutable view of what sections of the wire
/// frame this subscriber wants, set by its own `subscribe` control message
/// and read by its own frame-sending task. Never touched by the session.
#[derive(Default)]
struct ConnectionOptions {
    want_color: AtomicBool,
    want_features: AtomicBool,
}

impl ConnectionOptions {
    fn apply(&self, options: SubscribeOptions) {
        self.want_color.store(options.want_color, Ordering::Relaxed);
        self.want_features.store(options.want_features, Ordering::Relaxed);
    }

    fn want_color(&self) -> bool {
        self.want_color.load(Ordering::Relaxed)
    }

    fn want_features(&self) -> bool {
        self.want_features.load(Ordering::Relaxed)
    }
}

/// Runs the accept loop until `shutdown` is cancelled. Each accepted
/// connection is handled on its own task and never blocks the accept
/// loop or any other subscriber (spec.md §4.8, §5).
pub async fn serve(
    addr: SocketAddr,
    tick_rx: TickReceiver,
    control_tx: mpsc::UnboundedSender<ControlEnvelope>,
    diagnostics: Arc<Diagnostics>,
    slow_subscriber_limit: u32,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Io(format!("failed to bind {addr}: {e}")))?;
    tracing::info!("broadcast server listening on {addr}");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("broadcast server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                tracing::info!("subscriber connected: {peer}");

                let tick_rx = tick_rx.clone();
                let control_tx = control_tx.clone();
                let diagnostics = diagnostics.clone();
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, tick_rx, control_tx, diagnostics, slow_subscriber_limit, conn_shutdown).await;
                });
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    mut tick_rx: TickReceiver,
    control_tx: mpsc::UnboundedSender<ControlEnvelope>,
    diagnostics: Arc<Diagnostics>,
    slow_subscriber_limit: u32,
    shutdown: CancellationToken,
) {
    diagnostics.inc_subscribers();
    let (read_half, write_half) = stream.into_split();
    let options = Arc::new(ConnectionOptions::default());
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_task = tokio::spawn(writer_loop(write_half, out_rx));
    let frame_opts = options.clone();
    let frame_out = out_tx.clone();
    let frame_shutdown = shutdown.clone();
    let frame_task = tokio::spawn(async move {
        frame_loop(&mut tick_rx, frame_out, frame_opts, slow_subscriber_limit, frame_shutdown).await
    });

    let control_result = control_loop(read_half, out_tx, options, control_tx, shutdown).await;
    frame_task.abort();
    drop(control_result);

    // `writer_task` exits once every `out_tx` clone is dropped; the
    // `frame_loop` one was moved into `frame_task`, which we've just
    // aborted, so dropping our own handle here is what ultimately closes
    // the channel and lets the writer flush and return.
    let _ = writer_task.await;
    diagnostics.dec_subscribers();
    tracing::info!("subscriber disconnected: {peer}");
}

/// Sends one `PublishedFrame` per observed tick, honoring this
/// connection's subscribe options, until the tick stream is closed, the
/// session shuts down, or this subscriber has fallen behind by more than
/// `slow_subscriber_limit` consecutive drops.
async fn frame_loop(
    tick_rx: &mut TickReceiver,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    options: Arc<ConnectionOptions>,
    slow_subscriber_limit: u32,
    shutdown: CancellationToken,
) {
    let mut last_sent_frame_id: Option<u64> = None;
    let mut consecutive_drops: u32 = 0;

    loop {
        let tick = {
            // The first iteration consumes whatever tick is already
            // current (including the sentinel) without waiting; every
            // later iteration waits for a genuinely new one, which is
            // how a watch channel implements "newest wins, never blocks
            // the producer" for many independent readers at once.
            if last_sent_frame_id.is_none() {
                tick_rx.borrow_and_update().clone()
            } else {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = tick_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        tick_rx.borrow_and_update().clone()
                    }
                }
            }
        };

        consecutive_drops = update_drop_count(last_sent_frame_id, tick.frame_id, consecutive_drops);
        if consecutive_drops > slow_subscriber_limit {
            tracing::warn!(
                "subscriber disconnected after {consecutive_drops} consecutive dropped frames"
            );
            return;
        }

        let color = if options.want_color() { tick.color.as_deref() } else { None };
        let features = if options.want_features() { tick.features.as_deref() } else { None };
        let published = PublishedFrame::from_grid(
            tick.frame_id,
            tick.capture_ts_ns,
            tick.calibration_rev,
            &tick.grid,
            color,
            features,
            tick.health.clone(),
        );
        last_sent_frame_id = Some(tick.frame_id);

        let Ok(encoded) = published.encode() else {
            tracing::error!("failed to encode published frame, dropping subscriber");
            return;
        };
        if send_framed(&out_tx, encoded).is_err() {
            return;
        }
    }
}

/// Reads newline-delimited control requests from this subscriber's read
/// half, applies `subscribe` locally, and forwards every other op to the
/// session for acknowledgement (spec.md §4.8: "invalid messages are
/// rejected with a reason code and do not affect other subscribers").
async fn control_loop(
    read_half: tokio::net::tcp::OwnedReadHalf,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    options: Arc<ConnectionOptions>,
    control_tx: mpsc::UnboundedSender<ControlEnvelope>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => line.map_err(|e| Error::SubscriberProtocol(e.to_string()))?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: ControlRequest = match decode_control_request(&line) {
            Ok(r) => r,
            Err(e) => {
                let response = ControlResponse::error(0, e.to_string());
                if let Ok(bytes) = encode_control_line(&response) {
                    let _ = out_tx.send(bytes);
                }
                continue;
            }
        };

        let (status, reason) = dispatch_control(request.op, &options, &control_tx).await;
        let response = ControlResponse {
            op_id: request.op_id,
            status,
            reason,
        };
        if let Ok(bytes) = encode_control_line(&response) {
            if out_tx.send(bytes).is_err() {
                return Ok(());
            }
        }
    }
}

async fn dispatch_control(
    op: ControlOp,
    options: &ConnectionOptions,
    control_tx: &mpsc::UnboundedSender<ControlEnvelope>,
) -> (ControlStatus, Option<String>) {
    if let ControlOp::Subscribe { options: subscribe_options } = op {
        options.apply(subscribe_options);
        return (ControlStatus::Ok, None);
    }

    let (respond, receiver) = oneshot::channel();
    if control_tx.send(ControlEnvelope { op, respond }).is_err() {
        return (ControlStatus::Error, Some("session unavailable".to_string()));
    }
    match receiver.await {
        Ok((status, reason)) => (status, reason),
        Err(_) => (ControlStatus::Error, Some("session dropped the request".to_string())),
    }
}

/// Computes the updated consecutive-drop count for a subscriber given the
/// last frame id it was actually sent and the newly observed tick's frame
/// id, factored out of `frame_loop` so the "gaps accumulate, a run of
/// consecutive ids resets to zero" rule (spec.md §4.8, §8) is directly
/// testable without a watch channel or a socket.
fn update_drop_count(last_sent: Option<u64>, frame_id: u64, consecutive_drops: u32) -> u32 {
    match last_sent {
        Some(last) => {
            let skipped = frame_id.saturating_sub(last).saturating_sub(1);
            if skipped > 0 {
                consecutive_drops.saturating_add(skipped as u32)
            } else {
                0
            }
        }
        None => consecutive_drops,
    }
}

fn send_framed(out_tx: &mpsc::UnboundedSender<Vec<u8>>, payload: Vec<u8>) -> std::result::Result<(), ()> {
    let mut framed = Vec::with_capacity(payload.len() + 4);
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(&payload);
    out_tx.send(framed).map_err(|_| ())
}

/// Drains outbound byte buffers onto the socket in arrival order so a
/// single physical connection can safely interleave frame payloads and
/// control responses from two independent producer tasks.
async fn writer_loop(mut write_half: tokio::net::tcp::OwnedWriteHalf, mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(buf) = out_rx.recv().await {
        if write_half.write_all(&buf).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_frame_ids_keep_drop_count_at_zero() {
        let drops = update_drop_count(Some(5), 6, 0);
        assert_eq!(drops, 0);
    }

    #[test]
    fn a_gap_accumulates_the_number_of_skipped_ids() {
        let drops = update_drop_count(Some(5), 9, 0);
        assert_eq!(drops, 3);
    }

    #[test]
    fn gaps_accumulate_across_multiple_observations() {
        let drops = update_drop_count(Some(5), 9, 2);
        assert_eq!(drops, 5);
    }

    #[test]
    fn a_caught_up_observation_resets_the_count() {
        let drops = update_drop_count(Some(9), 10, 7);
        assert_eq!(drops, 0);
    }

    #[test]
    fn first_observation_never_counts_as_a_drop() {
        let drops = update_drop_count(None, 42, 0);
        assert_eq!(drops, 0);
    }

    #[test]
    fn connection_options_default_to_everything_off() {
        let options = ConnectionOptions::default();
        assert!(!options.want_color());
        assert!(!options.want_features());
        options.apply(SubscribeOptions { want_color: true, want_features: true });
        assert!(options.want_color());
        assert!(options.want_features());
    }
}
