use std::{io, path::PathBuf};

use mcshard::{
  proxy,
  router::{Config, EndpointConfig},
};
use url::Url;

#[tokio::main]
async fn main() -> io::Result<()> {
  tracing_subscriber::fmt::init();

  let cmd = clap::Command::new("mcshard")
    .version(env!("CARGO_PKG_VERSION"))
    .arg(
      clap::Arg::new("config")
        .short('c')
        .long("config")
        .value_parser(clap::value_parser!(PathBuf)),
    )
    .arg(
      clap::Arg::new("bind")
        .short('b')
        .long("bind")
        .default_value("[::]:11211"),
    )
    .arg(
      clap::Arg::new("upstream-url")
        .short('u')
        .long("upstream-url")
        .action(clap::ArgAction::Append)
        .value_parser(Url::parse),
    );

  let matches = cmd.get_matches();

  let config = match matches.get_one::<PathBuf>("config") {
    Some(path) => {
      let raw = std::fs::read_to_string(path)?;
      serde_json::from_str(&raw).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?
    }
    None => {
      let listen = matches
        .get_one::<String>("bind")
        .cloned()
        .unwrap_or_else(|| "[::]:11211".to_string());
      let upstreams = matches
        .get_many::<Url>("upstream-url")
        .map(|urls| urls.cloned().collect())
        .unwrap_or_default();
      Config {
        endpoints: vec![EndpointConfig {
          listen,
          upstreams,
          hash: None,
          high_water_mark: None,
          pipeline_depth: None,
        }],
      }
    }
  };

  proxy::run(config).await
}
