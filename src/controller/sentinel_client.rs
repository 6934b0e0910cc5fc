//! Minimal Sentinel client
//!
//! Asks a single sentinel which address it currently considers master for a
//! monitored group, using `SENTINEL get-master-addr-by-name` over RESP.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use crate::error::{Error, Result};

use super::config::SENTINEL_PORT;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on a reply; two short bulk strings never come close
const MAX_REPLY_BYTES: usize = 4096;

/// Master address as reported by a sentinel
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MasterAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for MasterAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Query interface against one sentinel
#[async_trait]
pub trait SentinelQuery: Send + Sync {
    /// `Ok(None)` means the sentinel answered but does not know the group
    async fn master_addr(&self, sentinel_host: &str, group: &str) -> Result<Option<MasterAddr>>;
}

/// Talks RESP to sentinels over plain TCP
#[derive(Clone, Debug)]
pub struct RespSentinelClient {
    pub port: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for RespSentinelClient {
    fn default() -> Self {
        Self {
            port: SENTINEL_PORT as u16,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl RespSentinelClient {
    pub fn new(port: u16, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
            read_timeout,
        }
    }
}

#[async_trait]
impl SentinelQuery for RespSentinelClient {
    // TODO: speak TLS to sentinels whose pods mount the TLS secret
    async fn master_addr(&self, sentinel_host: &str, group: &str) -> Result<Option<MasterAddr>> {
        let addr = format!("{}:{}", sentinel_host, self.port);
        let query_error = |message: String| Error::SentinelQueryError {
            address: addr.clone(),
            message,
        };

        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(query_error(e.to_string())),
            Err(_) => return Err(query_error("connect timeout".to_string())),
        };

        stream
            .write_all(&encode_command(&["SENTINEL", "get-master-addr-by-name", group]))
            .await
            .map_err(|e| query_error(e.to_string()))?;

        let mut response = Vec::with_capacity(128);
        let mut buf = [0u8; 512];

        let read_result = timeout(self.read_timeout, async {
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed before a full reply",
                    ));
                }
                response.extend_from_slice(&buf[..n]);
                if response.len() > MAX_REPLY_BYTES {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "reply too large",
                    ));
                }
                if let ReplyState::Complete(reply) = parse_master_addr_reply(&response)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?
                {
                    return Ok(reply);
                }
            }
        })
        .await;

        match read_result {
            Ok(Ok(reply)) => {
                trace!(sentinel = %addr, group, reply = ?reply, "sentinel answered");
                Ok(reply)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                Err(Error::ProtocolError(format!("{}: {}", addr, e)))
            }
            Ok(Err(e)) => Err(query_error(e.to_string())),
            Err(_) => Err(query_error("read timeout".to_string())),
        }
    }
}

/// Encode a command as a RESP array of bulk strings
pub fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Progress of parsing a buffered reply
#[derive(Debug, PartialEq, Eq)]
pub enum ReplyState {
    /// More bytes are needed
    Incomplete,
    /// `None` for a null reply
    Complete(Option<MasterAddr>),
}

/// Parse the reply to `get-master-addr-by-name`
///
/// Accepts a two element array of bulk strings, a null array or a null bulk
/// string. Error replies and anything else are protocol errors.
pub fn parse_master_addr_reply(buf: &[u8]) -> Result<ReplyState> {
    let Some((header, mut rest)) = split_line(buf) else {
        return Ok(ReplyState::Incomplete);
    };

    match header.first() {
        Some(b'-') => Err(Error::ProtocolError(
            String::from_utf8_lossy(&header[1..]).to_string(),
        )),
        Some(b'*') | Some(b'$') if &header[1..] == b"-1" => Ok(ReplyState::Complete(None)),
        Some(b'*') => {
            let count = parse_len(&header[1..])?;
            if count != 2 {
                return Err(Error::ProtocolError(format!(
                    "expected a 2 element array, got {}",
                    count
                )));
            }

            let mut items = Vec::with_capacity(2);
            for _ in 0..2 {
                match read_bulk(rest)? {
                    Some((item, remaining)) => {
                        items.push(item);
                        rest = remaining;
                    }
                    None => return Ok(ReplyState::Incomplete),
                }
            }

            let host = items[0].clone();
            let port = items[1].parse::<u16>().map_err(|_| {
                Error::ProtocolError(format!("invalid port {:?}", items[1]))
            })?;
            Ok(ReplyState::Complete(Some(MasterAddr { host, port })))
        }
        _ => Err(Error::ProtocolError(format!(
            "unexpected reply {:?}",
            String::from_utf8_lossy(header)
        ))),
    }
}

fn split_line(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..pos], &buf[pos + 2..]))
}

fn parse_len(raw: &[u8]) -> Result<usize> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| {
            Error::ProtocolError(format!("invalid length {:?}", String::from_utf8_lossy(raw)))
        })
}

fn read_bulk(buf: &[u8]) -> Result<Option<(String, &[u8])>> {
    let Some((header, rest)) = split_line(buf) else {
        return Ok(None);
    };
    if header.first() != Some(&b'$') {
        return Err(Error::ProtocolError(format!(
            "expected a bulk string, got {:?}",
            String::from_utf8_lossy(header)
        )));
    }
    let len = parse_len(&header[1..])?;
    if len > MAX_REPLY_BYTES {
        return Err(Error::ProtocolError(format!(
            "bulk string length {} exceeds {} bytes",
            len, MAX_REPLY_BYTES
        )));
    }
    let Some(end) = len.checked_add(2) else {
        return Err(Error::ProtocolError(format!("invalid bulk length {}", len)));
    };
    if rest.len() < end {
        return Ok(None);
    }
    let value = String::from_utf8_lossy(&rest[..len]).to_string();
    Ok(Some((value, &rest[end..])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        assert_eq!(
            encode_command(&["SENTINEL", "get-master-addr-by-name", "cache1-master"]),
            b"*3\r\n$8\r\nSENTINEL\r\n$23\r\nget-master-addr-by-name\r\n$13\r\ncache1-master\r\n"
                .to_vec()
        );
    }

    #[test]
    fn test_parse_address_reply() {
        let reply = b"*2\r\n$8\r\n10.0.0.7\r\n$4\r\n6379\r\n";
        assert_eq!(
            parse_master_addr_reply(reply).unwrap(),
            ReplyState::Complete(Some(MasterAddr {
                host: "10.0.0.7".to_string(),
                port: 6379,
            }))
        );
    }

    #[test]
    fn test_parse_null_replies() {
        assert_eq!(
            parse_master_addr_reply(b"*-1\r\n").unwrap(),
            ReplyState::Complete(None)
        );
        assert_eq!(
            parse_master_addr_reply(b"$-1\r\n").unwrap(),
            ReplyState::Complete(None)
        );
    }

    #[test]
    fn test_parse_partial_reply() {
        assert_eq!(parse_master_addr_reply(b"").unwrap(), ReplyState::Incomplete);
        assert_eq!(parse_master_addr_reply(b"*2\r").unwrap(), ReplyState::Incomplete);
        assert_eq!(
            parse_master_addr_reply(b"*2\r\n$8\r\n10.0.0.7\r\n$4\r\n63").unwrap(),
            ReplyState::Incomplete
        );
    }

    #[test]
    fn test_parse_error_reply() {
        let err = parse_master_addr_reply(b"-ERR unknown command\r\n").unwrap_err();
        assert!(matches!(err, Error::ProtocolError(msg) if msg.contains("unknown command")));
    }

    #[test]
    fn test_parse_malformed_reply() {
        assert!(parse_master_addr_reply(b"+OK\r\n").is_err());
        assert!(parse_master_addr_reply(b"*3\r\n").is_err());
        assert!(parse_master_addr_reply(b"*2\r\n$8\r\n10.0.0.7\r\n$4\r\nabcd\r\n").is_err());
    }

    #[test]
    fn test_parse_oversized_bulk_length() {
        let err = parse_master_addr_reply(b"*2\r\n$18446744073709551615\r\nab\r\n$4\r\n6379\r\n")
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolError(_)));

        let err = parse_master_addr_reply(b"*2\r\n$5000\r\nab\r\n").unwrap_err();
        assert!(matches!(err, Error::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_query_against_local_listener() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await.unwrap();
            // Split the reply to exercise buffering
            socket.write_all(b"*2\r\n$8\r\n10.0.0.9").await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(b"\r\n$4\r\n6379\r\n").await.unwrap();
        });

        let client = RespSentinelClient::new(port, Duration::from_secs(1), Duration::from_secs(1));
        let reply = client.master_addr("127.0.0.1", "cache1-master").await.unwrap();
        assert_eq!(reply.unwrap().to_string(), "10.0.0.9:6379");
    }

    #[tokio::test]
    async fn test_unreachable_sentinel_is_query_error() {
        let client = RespSentinelClient::new(1, Duration::from_millis(200), Duration::from_millis(200));
        let err = client.master_addr("127.0.0.1", "cache1-master").await.unwrap_err();
        assert!(matches!(err, Error::SentinelQueryError { .. }));
    }
}
