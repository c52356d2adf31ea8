use std::{future::Future, io};

use tokio::{
  io::{AsyncRead, AsyncWrite, BufReader},
  net::{TcpListener, UnixListener},
};
use tracing::{error, info, warn};

use crate::{
  codec::{self, Command},
  message::PendingMessage,
  queue::{ResponseQueue, DEFAULT_PIPELINE_DEPTH},
  router::{Config, Router},
};

/// One listening socket. An endpoint string containing `:` is a TCP bind
/// address, anything else a filesystem path for a stream socket.
pub enum Listener {
  Tcp(TcpListener),
  Unix(UnixListener),
}

impl Listener {
  pub async fn bind(endpoint: &str) -> io::Result<Self> {
    if endpoint.contains(':') {
      TcpListener::bind(endpoint).await.map(Self::Tcp)
    } else {
      UnixListener::bind(endpoint).map(Self::Unix)
    }
  }
}

/// Runs every configured endpoint until interrupted. Each endpoint owns its
/// listeners, upstream connections, and router; in-flight client tasks are
/// abandoned at process exit.
pub async fn run(config: Config) -> io::Result<()> {
  let mut tasks = Vec::with_capacity(config.endpoints.len());

  for endpoint in config.endpoints {
    if endpoint.upstreams.is_empty() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("endpoint {} has no upstreams", endpoint.listen),
      ));
    }

    let listener = Listener::bind(&endpoint.listen).await?;
    info!("listening for memcache requests at {}", endpoint.listen);

    let router = Router::from_config(&endpoint);
    let pipeline_depth = endpoint.pipeline_depth.unwrap_or(DEFAULT_PIPELINE_DEPTH);
    tasks.push(tokio::task::spawn(async move {
      let interrupt = async {
        tokio::signal::ctrl_c().await.ok();
      };
      serve(listener, router, pipeline_depth, interrupt).await
    }));
  }

  for task in tasks {
    task.await.map_err(|err| io::Error::new(io::ErrorKind::Other, err))??;
  }

  Ok(())
}

/// Accept loop for one endpoint. Every accepted connection runs as its own
/// task; an accept error terminates the endpoint.
pub async fn serve(
  listener: Listener,
  router: Router,
  pipeline_depth: usize,
  shutdown: impl Future<Output = ()>,
) -> io::Result<()> {
  tokio::pin!(shutdown);

  match listener {
    Listener::Tcp(listener) => loop {
      tokio::select! {
        _ = &mut shutdown => break,
        r = listener.accept() => match r {
          Ok((stream, _addr)) => {
            tokio::task::spawn(serve_client(stream, router.clone(), pipeline_depth));
          }
          Err(err) => {
            error!("accept failed: {err}");
            return Err(err);
          }
        },
      }
    },
    Listener::Unix(listener) => loop {
      tokio::select! {
        _ = &mut shutdown => break,
        r = listener.accept() => match r {
          Ok((stream, _addr)) => {
            tokio::task::spawn(serve_client(stream, router.clone(), pipeline_depth));
          }
          Err(err) => {
            error!("accept failed: {err}");
            return Err(err);
          }
        },
      }
    },
  }

  Ok(())
}

/// Drives one client connection: frames commands, routes each to its shard,
/// and records the reply slot so the drain task can write replies back in
/// request order. Protocol errors are fatal to the connection, the byte
/// stream can no longer be aligned to command boundaries.
pub async fn serve_client(stream: impl AsyncRead + AsyncWrite + Send + 'static, router: Router, pipeline_depth: usize) {
  let (r, w) = tokio::io::split(stream);
  let mut r = BufReader::new(r);
  let (queue, drain) = ResponseQueue::spawn(w, pipeline_depth);

  loop {
    match codec::read_command(&mut r).await {
      Ok(Command { kind, key, raw }) => {
        let (message, completion) = PendingMessage::new(raw, kind);
        if !queue.record_outgoing(completion).await {
          break;
        }
        // a failed send drops the message and the completion resolves to
        // the synthetic error
        router.route(&key).send(message).await.ok();
      }
      Err(codec::Error::Eof) => break,
      Err(err) => {
        warn!("closing client connection: {err}");
        break;
      }
    }
  }

  drop(queue);
  drain.await.ok();
}
