use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors raised while parsing an NMDC handshake line.
#[derive(Debug, Error)]
pub enum NmdcError {
    /// The line did not start with a `$` command marker.
    #[error("not a command")]
    NotACommand,

    /// A known command was missing required arguments.
    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// A client-client NMDC command.
///
/// Only the handshake fragments the connection manager produces or
/// consumes are modelled; anything else parses as [`NmdcCommand::Unknown`]
/// and is ignored by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NmdcCommand {
    /// `$MyNick <nick>`. The nick is kept as raw bytes because it arrives
    /// in the hub's wire encoding.
    MyNick { nick: Vec<u8> },
    /// `$Lock <lock> Pk=<pk>`.
    Lock { lock: String, pk: String },
    /// `$Supports <feat> <feat> ...`.
    Supports { features: Vec<String> },
    /// `$Direction <Upload|Download> <number>`.
    Direction { download: bool, number: u16 },
    /// `$Key <key>`. Key bytes are arbitrary after DCN escaping.
    Key { key: Vec<u8> },
    /// Any other `$` command.
    Unknown(String),
}

impl NmdcCommand {
    /// Parses one line (terminator already stripped).
    pub fn parse(line: &[u8]) -> Result<Self, NmdcError> {
        if line.first() != Some(&b'$') {
            return Err(NmdcError::NotACommand);
        }
        let body = &line[1..];
        let (name, args) = match body.iter().position(|&b| b == b' ') {
            Some(pos) => (&body[..pos], &body[pos + 1..]),
            None => (body, &body[body.len()..]),
        };

        match name {
            b"MyNick" => {
                if args.is_empty() {
                    return Err(NmdcError::Malformed("MyNick"));
                }
                Ok(NmdcCommand::MyNick {
                    nick: args.to_vec(),
                })
            }
            b"Lock" => {
                let text = String::from_utf8_lossy(args);
                let (lock, rest) = text
                    .split_once(' ')
                    .ok_or(NmdcError::Malformed("Lock"))?;
                let pk = rest
                    .strip_prefix("Pk=")
                    .ok_or(NmdcError::Malformed("Lock"))?;
                Ok(NmdcCommand::Lock {
                    lock: lock.to_string(),
                    pk: pk.to_string(),
                })
            }
            b"Supports" => {
                let text = String::from_utf8_lossy(args);
                Ok(NmdcCommand::Supports {
                    features: text.split_whitespace().map(str::to_string).collect(),
                })
            }
            b"Direction" => {
                let text = String::from_utf8_lossy(args);
                let (dir, num) = text
                    .split_once(' ')
                    .ok_or(NmdcError::Malformed("Direction"))?;
                let download = match dir {
                    "Download" => true,
                    "Upload" => false,
                    _ => return Err(NmdcError::Malformed("Direction")),
                };
                // Legacy clients send garbage numbers now and then; read
                // them as 0 like the rest of the network does.
                let number = num.trim().parse::<u16>().unwrap_or(0).min(0x7fff);
                Ok(NmdcCommand::Direction { download, number })
            }
            b"Key" => {
                if args.is_empty() {
                    return Err(NmdcError::Malformed("Key"));
                }
                Ok(NmdcCommand::Key { key: args.to_vec() })
            }
            _ => Ok(NmdcCommand::Unknown(
                String::from_utf8_lossy(name).into_owned(),
            )),
        }
    }

    /// Encodes the command with its CRLF terminator.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            NmdcCommand::MyNick { nick } => {
                buf.put_slice(b"$MyNick ");
                buf.put_slice(nick);
            }
            NmdcCommand::Lock { lock, pk } => {
                buf.put_slice(b"$Lock ");
                buf.put_slice(lock.as_bytes());
                buf.put_slice(b" Pk=");
                buf.put_slice(pk.as_bytes());
            }
            NmdcCommand::Supports { features } => {
                buf.put_slice(b"$Supports ");
                buf.put_slice(features.join(" ").as_bytes());
            }
            NmdcCommand::Direction { download, number } => {
                buf.put_slice(b"$Direction ");
                buf.put_slice(if *download { b"Download" } else { b"Upload" });
                buf.put_slice(format!(" {}", number).as_bytes());
            }
            NmdcCommand::Key { key } => {
                buf.put_slice(b"$Key ");
                buf.put_slice(key);
            }
            NmdcCommand::Unknown(name) => {
                buf.put_u8(b'$');
                buf.put_slice(name.as_bytes());
            }
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}
