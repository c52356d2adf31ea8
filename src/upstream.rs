use std::io;

use bytes::Bytes;
use tokio::{
  io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream},
  net::TcpStream,
  sync::mpsc,
  task::JoinHandle,
};
use tracing::warn;
use url::Url;

use crate::{codec::CommandKind, message::PendingMessage};

/// Requests an upstream may have queued before senders suspend.
pub const DEFAULT_HIGH_WATER_MARK: usize = 1024;

/// Handle used to enqueue requests for one upstream server. Sends never fail
/// synchronously; they suspend at the high-water mark.
pub type UpstreamSender = mpsc::Sender<PendingMessage>;

pub fn connect_upstream(url: Url, high_water_mark: usize) -> UpstreamSender {
  let (sender, receiver) = mpsc::channel(high_water_mark);
  spawn_upstream(receiver, url);
  sender
}

/// Owns the connection to one memcache server. Requests are written in queue
/// order and replies matched back first-in/first-out, relying on memcached's
/// ordered reply contract on a single connection. Any I/O failure completes
/// the in-flight request and everything still queued with the synthetic
/// error, then drops the connection; the next request reconnects.
pub fn spawn_upstream(mut receiver: mpsc::Receiver<PendingMessage>, url: Url) -> JoinHandle<()> {
  tokio::task::spawn(async move {
    let mut connection: Option<Connection> = None;

    while let Some(message) = receiver.recv().await {
      let mut conn = match connection.take() {
        Some(conn) => conn,
        None => match Connection::connect(&url).await {
          Ok(conn) => conn,
          Err(err) => {
            warn!("connect to upstream {url} failed: {err}");
            fail_queued(message, &mut receiver);
            continue;
          }
        },
      };

      match conn.exchange(message.raw(), message.kind()).await {
        Ok(response) => {
          message.complete(response);
          connection = Some(conn);
        }
        Err(err) => {
          warn!("upstream {url} failed: {err}");
          fail_queued(message, &mut receiver);
        }
      }
    }
  })
}

fn fail_queued(message: PendingMessage, receiver: &mut mpsc::Receiver<PendingMessage>) {
  message.complete_unavailable();
  while let Ok(queued) = receiver.try_recv() {
    queued.complete_unavailable();
  }
}

struct Connection {
  stream: BufStream<TcpStream>,
}

impl Connection {
  async fn connect(url: &Url) -> io::Result<Self> {
    if url.scheme() != "tcp" {
      return Err(io::Error::new(io::ErrorKind::InvalidInput, "upstream url must be tcp"));
    }

    // connect resolves the host itself and tries every returned address
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(11211);
    let stream = TcpStream::connect(format!("{host}:{port}")).await?;

    Ok(Self {
      stream: BufStream::new(stream),
    })
  }

  async fn exchange(&mut self, raw: &Bytes, kind: CommandKind) -> io::Result<Bytes> {
    self.stream.write_all(raw).await?;
    self.stream.flush().await?;
    self.read_reply(kind).await
  }

  /// Frames one reply without interpreting it. Retrieval replies are zero or
  /// more `VALUE <key> <flags> <bytes>[ <cas>]\r\n<data>\r\n` records closed
  /// by `END\r\n` (or cut short by an error line); everything else is a
  /// single line.
  async fn read_reply(&mut self, kind: CommandKind) -> io::Result<Bytes> {
    let mut reply = Vec::new();

    if kind.is_retrieval() {
      loop {
        let line_start = reply.len();
        self.read_line(&mut reply).await?;
        if !reply[line_start..].starts_with(b"VALUE ") {
          break;
        }

        let data_len = value_data_len(&reply[line_start..])?;
        let data_start = reply.len();
        reply.resize(data_start + data_len + 2, 0);
        self.stream.read_exact(&mut reply[data_start..]).await?;
        if !reply.ends_with(b"\r\n") {
          return Err(invalid_data("value data not terminated by \\r\\n"));
        }
      }
    } else {
      self.read_line(&mut reply).await?;
    }

    Ok(Bytes::from(reply))
  }

  async fn read_line(&mut self, buffer: &mut Vec<u8>) -> io::Result<()> {
    let n = self.stream.read_until(b'\n', buffer).await?;
    if n == 0 {
      return Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "upstream closed the connection",
      ));
    }
    if !buffer.ends_with(b"\r\n") {
      return Err(invalid_data("reply line not terminated by \\r\\n"));
    }
    Ok(())
  }
}

fn value_data_len(line: &[u8]) -> io::Result<usize> {
  let line = &line[..line.len() - 2];
  line
    .split(|b| *b == b' ')
    .nth(3)
    .and_then(|token| std::str::from_utf8(token).ok())
    .and_then(|token| token.parse().ok())
    .ok_or_else(|| invalid_data("malformed VALUE line"))
}

fn invalid_data(message: &'static str) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, message)
}
