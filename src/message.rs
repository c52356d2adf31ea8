use bytes::Bytes;
use tokio::sync::oneshot;

use crate::codec::CommandKind;

/// Reply substituted when an upstream cannot produce one.
pub const UPSTREAM_UNAVAILABLE: &[u8] = b"SERVER_ERROR upstream unavailable\r\n";

/// One in-flight request. The upstream client owns the message while it
/// writes `raw` and frames the reply; the originating client's response
/// queue owns the matching [`Completion`].
#[derive(Debug)]
pub struct PendingMessage {
  raw: Bytes,
  kind: CommandKind,
  completion: oneshot::Sender<Bytes>,
}

#[derive(Debug)]
pub struct Completion(oneshot::Receiver<Bytes>);

impl PendingMessage {
  pub fn new(raw: Bytes, kind: CommandKind) -> (Self, Completion) {
    let (sender, receiver) = oneshot::channel();
    let message = Self {
      raw,
      kind,
      completion: sender,
    };
    (message, Completion(receiver))
  }

  pub fn raw(&self) -> &Bytes {
    &self.raw
  }

  pub fn kind(&self) -> CommandKind {
    self.kind
  }

  /// Fires the completion signal with the verbatim upstream reply. Fires at
  /// most once; the receiver may already be gone if the client left.
  pub fn complete(self, response: Bytes) {
    self.completion.send(response).ok();
  }

  pub fn complete_unavailable(self) {
    self.complete(Bytes::from_static(UPSTREAM_UNAVAILABLE));
  }
}

impl Completion {
  /// Resolves to the upstream reply, or to the synthetic error when the
  /// message was dropped without ever being completed.
  pub async fn wait(self) -> Bytes {
    self.0.await.unwrap_or_else(|_| Bytes::from_static(UPSTREAM_UNAVAILABLE))
  }
}
