use crc::{Crc, CRC_32_ISO_HDLC};
use url::Url;

use crate::upstream::{connect_upstream, UpstreamSender, DEFAULT_HIGH_WATER_MARK};

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct Config {
  pub endpoints: Vec<EndpointConfig>,
}

/// One listening endpoint with its own set of upstreams. `listen` is a TCP
/// bind address when it contains `:`, otherwise a filesystem path for a
/// stream socket.
#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct EndpointConfig {
  pub listen: String,
  pub upstreams: Vec<Url>,
  #[serde(default)]
  pub hash: Option<HashAlgorithm>,
  #[serde(default)]
  pub high_water_mark: Option<usize>,
  #[serde(default)]
  pub pipeline_depth: Option<usize>,
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
  Crc32,
}

/// Immutable key-to-upstream map for one endpoint. Built once at startup;
/// membership is fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Router {
  senders: Vec<UpstreamSender>,
  algorithm: HashAlgorithm,
}

impl Router {
  pub fn new(senders: Vec<UpstreamSender>, algorithm: HashAlgorithm) -> Self {
    assert!(!senders.is_empty());
    Self { senders, algorithm }
  }

  pub fn from_config(config: &EndpointConfig) -> Self {
    let high_water_mark = config.high_water_mark.unwrap_or(DEFAULT_HIGH_WATER_MARK);
    let senders = config
      .upstreams
      .iter()
      .cloned()
      .map(|url| connect_upstream(url, high_water_mark))
      .collect();
    Self::new(senders, config.hash.unwrap_or(HashAlgorithm::Crc32))
  }

  /// Deterministic: identical key bytes always map to the same upstream.
  pub fn route(&self, key: &[u8]) -> &UpstreamSender {
    let i = match self.senders.len() {
      1 => 0,
      n => self.checksum(key) % n,
    };
    &self.senders[i]
  }

  fn checksum(&self, key: &[u8]) -> usize {
    match self.algorithm {
      HashAlgorithm::Crc32 => Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(key) as usize,
    }
  }
}
