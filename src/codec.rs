use std::{fmt, io};

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::{MAX_ITEM_SIZE, MAX_KEY_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
  Get,
  Gets,
  Delete,
  Set,
  Add,
  Replace,
  Append,
  Prepend,
}

impl CommandKind {
  pub fn is_retrieval(&self) -> bool {
    matches!(self, Self::Get | Self::Gets)
  }

  pub fn is_storage(&self) -> bool {
    matches!(self, Self::Set | Self::Add | Self::Replace | Self::Append | Self::Prepend)
  }
}

/// One framed request. `raw` holds the verbatim wire bytes (header line and,
/// for storage commands, the value body with its trailing `\r\n`); `key` is a
/// sub-slice of `raw`.
#[derive(Debug, PartialEq)]
pub struct Command {
  pub kind: CommandKind,
  pub key: Bytes,
  pub raw: Bytes,
}

#[derive(Debug)]
pub enum Error {
  Eof,
  MalformedFraming,
  UnknownCommand,
  MultigetUnsupported,
  MultiDeleteUnsupported,
  MalformedStorageHeader,
  ValueTooLarge,
  MalformedValueBody,
  BadKey,
  NoreplyUnsupported,
  Io(io::Error),
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Eof => write!(f, "end of stream"),
      Self::MalformedFraming => write!(f, "request header did not end with \\r\\n"),
      Self::UnknownCommand => write!(f, "unknown command"),
      Self::MultigetUnsupported => write!(f, "get does not support multiple keys"),
      Self::MultiDeleteUnsupported => write!(f, "delete does not support multiple keys"),
      Self::MalformedStorageHeader => write!(f, "expected '<verb> <key> <flags> <expiry> <valuelen>'"),
      Self::ValueTooLarge => write!(f, "value length exceeds {} bytes", MAX_ITEM_SIZE),
      Self::MalformedValueBody => write!(f, "value was not followed by \\r\\n"),
      Self::BadKey => write!(f, "invalid key"),
      Self::NoreplyUnsupported => write!(f, "noreply is not supported"),
      Self::Io(err) => write!(f, "{err}"),
    }
  }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl PartialEq for Error {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
      _ => std::mem::discriminant(self) == std::mem::discriminant(other),
    }
  }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Frames one command from the client byte stream: the header line, plus the
/// value body for storage verbs. `Error::Eof` reports a clean close before
/// the next header.
pub async fn read_command(mut r: impl AsyncBufRead + Unpin) -> Result<Command> {
  fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
      return Err(Error::BadKey);
    }
    if key.iter().any(|b| *b <= b' ' || *b == 0x7f) {
      return Err(Error::BadKey);
    }
    Ok(())
  }

  fn parse_u32(token: &[u8]) -> Result<u32> {
    std::str::from_utf8(token)
      .ok()
      .and_then(|v| v.parse().ok())
      .ok_or(Error::MalformedStorageHeader)
  }

  // valuelen is declared as at most 30 bits; anything wider is a header
  // error, anything between MAX_ITEM_SIZE and 2^30 an oversized value.
  fn parse_value_len(token: &[u8]) -> Result<usize> {
    let len: u64 = std::str::from_utf8(token)
      .ok()
      .and_then(|v| v.parse().ok())
      .ok_or(Error::MalformedStorageHeader)?;
    if len > 1 << 30 {
      return Err(Error::MalformedStorageHeader);
    }
    Ok(len as usize)
  }

  fn decode_single_key_command(header: Vec<u8>, kind: CommandKind, multi_key: Error) -> Result<Command> {
    let line_len = header.len() - 2;
    let sp = match header[..line_len].iter().position(|b| *b == b' ') {
      Some(i) => i,
      None => return Err(Error::MalformedFraming),
    };
    if header[sp + 1..line_len].contains(&b' ') {
      return Err(multi_key);
    }
    validate_key(&header[sp + 1..line_len])?;

    let raw = Bytes::from(header);
    let key = raw.slice(sp + 1..line_len);
    Ok(Command { kind, key, raw })
  }

  // `<verb> <key> <flags> <expiry> <valuelen>\r\n` followed by exactly
  // `valuelen` body bytes and a final `\r\n`.
  async fn read_storage_command(
    mut r: impl AsyncBufRead + Unpin,
    mut header: Vec<u8>,
    kind: CommandKind,
  ) -> Result<Command> {
    let header_len = header.len();
    let value_len = {
      let line = &header[..header_len - 2];
      let tokens = line.split(|b| *b == b' ').collect::<Vec<_>>();
      if tokens.len() < 5 || tokens.len() > 6 {
        return Err(Error::MalformedStorageHeader);
      }
      if tokens.len() == 6 {
        if tokens[5] == b"noreply" {
          return Err(Error::NoreplyUnsupported);
        }
        return Err(Error::MalformedStorageHeader);
      }

      validate_key(tokens[1])?;
      parse_u32(tokens[2])?;
      parse_u32(tokens[3])?;
      let value_len = parse_value_len(tokens[4])?;
      if value_len > MAX_ITEM_SIZE {
        return Err(Error::ValueTooLarge);
      }
      value_len
    };

    header.resize(header_len + value_len + 2, 0);
    r.read_exact(&mut header[header_len..]).await.map_err(|err| match err.kind() {
      io::ErrorKind::UnexpectedEof => Error::MalformedValueBody,
      _ => Error::Io(err),
    })?;
    if !header.ends_with(b"\r\n") {
      return Err(Error::MalformedValueBody);
    }

    let key_start = header[..header_len].iter().position(|b| *b == b' ').map(|i| i + 1);
    let key_len = match key_start {
      Some(start) => header[start..].iter().position(|b| *b == b' ').unwrap_or(0),
      None => 0,
    };

    let raw = Bytes::from(header);
    let key = match key_start {
      Some(start) => raw.slice(start..start + key_len),
      None => Bytes::new(),
    };
    Ok(Command { kind, key, raw })
  }

  let mut header = Vec::new();
  let n = r.read_until(b'\n', &mut header).await?;
  if n == 0 {
    return Err(Error::Eof);
  }
  if header.len() < 2 || !header.ends_with(b"\r\n") {
    return Err(Error::MalformedFraming);
  }

  // verb comparison is case sensitive, as in memcached itself
  let verb = header[..header.len() - 2]
    .split(|b| *b == b' ')
    .next()
    .unwrap_or_default();
  let verb = std::str::from_utf8(verb).map_err(|_| Error::UnknownCommand)?;

  let kind = match verb {
    "get" => CommandKind::Get,
    "gets" => CommandKind::Gets,
    "delete" => CommandKind::Delete,
    "set" => CommandKind::Set,
    "add" => CommandKind::Add,
    "replace" => CommandKind::Replace,
    "append" => CommandKind::Append,
    "prepend" => CommandKind::Prepend,
    "" => return Err(Error::MalformedFraming),
    _ => return Err(Error::UnknownCommand),
  };

  if kind.is_storage() {
    read_storage_command(&mut r, header, kind).await
  } else {
    let multi_key = match kind {
      CommandKind::Delete => Error::MultiDeleteUnsupported,
      _ => Error::MultigetUnsupported,
    };
    decode_single_key_command(header, kind, multi_key)
  }
}
