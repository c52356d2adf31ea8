use std::{
  collections::HashMap,
  net::SocketAddr,
  sync::{Arc, Mutex},
  time::Duration,
};

use crc::{Crc, CRC_32_ISO_HDLC};
use mcshard::{
  proxy::{self, Listener},
  router::{HashAlgorithm, Router},
  upstream::connect_upstream,
};
use tokio::{
  io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream},
  net::{TcpListener, TcpStream},
};

/// In-process memcached good enough for the proxy's verbs. Each accepted
/// connection gets its own copy of the seed store; requests are appended to
/// the shared log before they are answered.
#[derive(Clone, Default)]
struct FakeUpstream {
  store: HashMap<String, String>,
  delays: HashMap<String, Duration>,
  log: Arc<Mutex<Vec<String>>>,
}

impl FakeUpstream {
  async fn spawn(self) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::task::spawn(async move {
      loop {
        let (stream, _addr) = match listener.accept().await {
          Ok(conn) => conn,
          Err(_) => break,
        };
        let mut state = self.clone();
        tokio::task::spawn(async move { state.serve(stream).await });
      }
    });

    addr
  }

  async fn serve(&mut self, stream: TcpStream) {
    let mut stream = BufStream::new(stream);

    loop {
      let mut line = String::new();
      match stream.read_line(&mut line).await {
        Ok(0) | Err(_) => return,
        Ok(_) => {}
      }
      self.log.lock().unwrap().push(line.clone());

      let line = line.trim_end().to_string();
      let tokens = line.split(' ').collect::<Vec<_>>();
      match tokens[0] {
        "get" | "gets" => {
          let key = tokens[1];
          if let Some(delay) = self.delays.get(key) {
            tokio::time::sleep(*delay).await;
          }
          let mut reply = Vec::new();
          if let Some(value) = self.store.get(key) {
            reply.extend_from_slice(format!("VALUE {key} 0 {}\r\n{value}\r\n", value.len()).as_bytes());
          }
          reply.extend_from_slice(b"END\r\n");
          stream.write_all(&reply).await.unwrap();
          stream.flush().await.unwrap();
        }
        "set" | "add" | "replace" | "append" | "prepend" => {
          let value_len = tokens[4].parse::<usize>().unwrap();
          let mut body = vec![0u8; value_len + 2];
          stream.read_exact(&mut body).await.unwrap();
          self
            .store
            .insert(tokens[1].to_string(), String::from_utf8_lossy(&body[..value_len]).into_owned());
          stream.write_all(b"STORED\r\n").await.unwrap();
          stream.flush().await.unwrap();
        }
        "delete" => {
          let reply: &[u8] = match self.store.remove(tokens[1]) {
            Some(_) => b"DELETED\r\n",
            None => b"NOT_FOUND\r\n",
          };
          stream.write_all(reply).await.unwrap();
          stream.flush().await.unwrap();
        }
        _ => {
          stream.write_all(b"ERROR\r\n").await.unwrap();
          stream.flush().await.unwrap();
        }
      }
    }
  }
}

async fn start_proxy(upstreams: &[SocketAddr]) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  let senders = upstreams
    .iter()
    .map(|addr| connect_upstream(format!("tcp://{addr}").parse().unwrap(), 64))
    .collect();
  let router = Router::new(senders, HashAlgorithm::Crc32);

  tokio::task::spawn(proxy::serve(
    Listener::Tcp(listener),
    router,
    32,
    std::future::pending::<()>(),
  ));

  addr
}

async fn connect(addr: SocketAddr) -> BufStream<TcpStream> {
  TcpStream::connect(addr).await.map(BufStream::new).unwrap()
}

async fn read_line(s: &mut BufStream<TcpStream>) -> String {
  let mut line = String::new();
  s.read_line(&mut line).await.unwrap();
  line
}

fn shard_of(key: &str, shards: usize) -> usize {
  Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(key.as_bytes()) as usize % shards
}

#[tokio::test]
async fn test_get_hit() {
  let upstream = FakeUpstream {
    store: [("foo".to_string(), "bar".to_string())].into(),
    ..Default::default()
  }
  .spawn()
  .await;
  let proxy = start_proxy(&[upstream]).await;
  let mut s = connect(proxy).await;

  s.write_all(b"get foo\r\n").await.unwrap();
  s.flush().await.unwrap();
  let mut buffer = String::new();
  s.read_line(&mut buffer).await.unwrap();
  s.read_line(&mut buffer).await.unwrap();
  s.read_line(&mut buffer).await.unwrap();
  assert_eq!("VALUE foo 0 3\r\nbar\r\nEND\r\n", buffer);

  s.write_all(b"get missing\r\n").await.unwrap();
  s.flush().await.unwrap();
  assert_eq!("END\r\n", read_line(&mut s).await);
}

#[tokio::test]
async fn test_set_then_get_then_delete() {
  let upstream = FakeUpstream::default().spawn().await;
  let proxy = start_proxy(&[upstream]).await;
  let mut s = connect(proxy).await;

  s.write_all(b"set x 0 0 5\r\nhello\r\n").await.unwrap();
  s.flush().await.unwrap();
  assert_eq!("STORED\r\n", read_line(&mut s).await);

  s.write_all(b"get x\r\n").await.unwrap();
  s.flush().await.unwrap();
  let mut buffer = String::new();
  s.read_line(&mut buffer).await.unwrap();
  s.read_line(&mut buffer).await.unwrap();
  s.read_line(&mut buffer).await.unwrap();
  assert_eq!("VALUE x 0 5\r\nhello\r\nEND\r\n", buffer);

  s.write_all(b"delete x\r\n").await.unwrap();
  s.flush().await.unwrap();
  assert_eq!("DELETED\r\n", read_line(&mut s).await);

  s.write_all(b"delete x\r\n").await.unwrap();
  s.flush().await.unwrap();
  assert_eq!("NOT_FOUND\r\n", read_line(&mut s).await);
}

#[tokio::test]
async fn test_pipelined_replies_keep_request_order() {
  // one key per shard, with the first request's upstream replying last
  let mut slow_key = None;
  let mut fast_key = None;
  for c in 'a'..='z' {
    let key = c.to_string();
    match shard_of(&key, 2) {
      0 if slow_key.is_none() => slow_key = Some(key),
      1 if fast_key.is_none() => fast_key = Some(key),
      _ => {}
    }
  }
  let (slow_key, fast_key) = (slow_key.unwrap(), fast_key.unwrap());

  let slow = FakeUpstream {
    store: [(slow_key.clone(), "one".to_string())].into(),
    delays: [(slow_key.clone(), Duration::from_millis(200))].into(),
    ..Default::default()
  }
  .spawn()
  .await;
  let fast = FakeUpstream {
    store: [(fast_key.clone(), "two".to_string())].into(),
    ..Default::default()
  }
  .spawn()
  .await;

  let proxy = start_proxy(&[slow, fast]).await;
  let mut s = connect(proxy).await;

  s.write_all(format!("get {slow_key}\r\nget {fast_key}\r\n").as_bytes())
    .await
    .unwrap();
  s.flush().await.unwrap();

  let mut buffer = String::new();
  for _ in 0..6 {
    s.read_line(&mut buffer).await.unwrap();
  }
  assert_eq!(
    format!("VALUE {slow_key} 0 3\r\none\r\nEND\r\nVALUE {fast_key} 0 3\r\ntwo\r\nEND\r\n"),
    buffer
  );
}

#[tokio::test]
async fn test_multiget_closes_the_connection() {
  let upstream = FakeUpstream::default();
  let log = upstream.log.clone();
  let addr = upstream.spawn().await;
  let proxy = start_proxy(&[addr]).await;
  let mut s = connect(proxy).await;

  s.write_all(b"get a b\r\n").await.unwrap();
  s.flush().await.unwrap();

  let mut buffer = Vec::new();
  s.read_to_end(&mut buffer).await.unwrap();
  assert!(buffer.is_empty());
  assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_oversized_value_closes_the_connection() {
  let upstream = FakeUpstream::default();
  let log = upstream.log.clone();
  let addr = upstream.spawn().await;
  let proxy = start_proxy(&[addr]).await;
  let mut s = connect(proxy).await;

  s.write_all(b"set x 0 0 1048577\r\n").await.unwrap();
  s.flush().await.unwrap();

  let mut buffer = Vec::new();
  s.read_to_end(&mut buffer).await.unwrap();
  assert!(buffer.is_empty());
  assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unavailable_upstream_preserves_the_connection() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);

  let proxy = start_proxy(&[addr]).await;
  let mut s = connect(proxy).await;

  s.write_all(b"get foo\r\n").await.unwrap();
  s.flush().await.unwrap();
  assert_eq!("SERVER_ERROR upstream unavailable\r\n", read_line(&mut s).await);

  s.write_all(b"get bar\r\n").await.unwrap();
  s.flush().await.unwrap();
  assert_eq!("SERVER_ERROR upstream unavailable\r\n", read_line(&mut s).await);
}

#[tokio::test]
async fn test_parse_error_does_not_affect_other_connections() {
  let upstream = FakeUpstream {
    store: [("foo".to_string(), "bar".to_string())].into(),
    ..Default::default()
  }
  .spawn()
  .await;
  let proxy = start_proxy(&[upstream]).await;

  let mut healthy = connect(proxy).await;
  let mut broken = connect(proxy).await;

  broken.write_all(b"munch\r\n").await.unwrap();
  broken.flush().await.unwrap();
  let mut buffer = Vec::new();
  broken.read_to_end(&mut buffer).await.unwrap();
  assert!(buffer.is_empty());

  healthy.write_all(b"get foo\r\n").await.unwrap();
  healthy.flush().await.unwrap();
  let mut buffer = String::new();
  healthy.read_line(&mut buffer).await.unwrap();
  healthy.read_line(&mut buffer).await.unwrap();
  healthy.read_line(&mut buffer).await.unwrap();
  assert_eq!("VALUE foo 0 3\r\nbar\r\nEND\r\n", buffer);
}
