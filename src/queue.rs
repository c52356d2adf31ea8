use tokio::{
  io::{AsyncWrite, AsyncWriteExt},
  sync::mpsc,
  task::JoinHandle,
};
use tracing::warn;

use crate::message::Completion;

/// Replies a client may have outstanding before its driver suspends.
pub const DEFAULT_PIPELINE_DEPTH: usize = 128;

/// Per-client FIFO of reply slots. Completions are recorded in request order
/// by the connection driver and drained sequentially by a single task, so
/// the bytes written to the client follow the order requests were received
/// even when upstream replies arrive out of order.
#[derive(Debug)]
pub struct ResponseQueue {
  sender: mpsc::Sender<Completion>,
}

impl ResponseQueue {
  pub fn spawn(w: impl AsyncWrite + Unpin + Send + 'static, depth: usize) -> (Self, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(depth);
    let handle = tokio::task::spawn(drain(receiver, w));
    (Self { sender }, handle)
  }

  /// Appends a reply slot to the tail. Suspends once `depth` replies are
  /// outstanding, which stalls the driver's read loop. Returns `false` when
  /// the drain task stopped because the client write side failed.
  pub async fn record_outgoing(&self, completion: Completion) -> bool {
    self.sender.send(completion).await.is_ok()
  }
}

async fn drain(mut receiver: mpsc::Receiver<Completion>, mut w: impl AsyncWrite + Unpin) {
  while let Some(completion) = receiver.recv().await {
    let response = completion.wait().await;
    if let Err(err) = w.write_all(&response).await {
      warn!("client write failed: {err}");
      return;
    }
    if receiver.is_empty() {
      if let Err(err) = w.flush().await {
        warn!("client flush failed: {err}");
        return;
      }
    }
  }

  w.flush().await.ok();
  w.shutdown().await.ok();
}
