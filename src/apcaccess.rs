//! apcaccess.rs
//!
//! Client for the apcupsd Network Information Server (NIS). Keeps one
//! persistent connection open and turns each `status` reply into a
//! [`RawStatus`] map.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::time::Duration;

use log::trace;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Command to request status from apcupsd (length-prefixed)
const CMD_STATUS: &[u8] = b"\x00\x06status";

/// Separator for key-value pairs
const SEP: char = ':';

/// Longest frame apcupsd is expected to send
const MAX_FRAME_LEN: usize = 4096;

/// A status report is a few dozen lines; anything past this is garbage.
const MAX_LINES: usize = 512;

/// Failure to establish a connection to the status service.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection to {addr} refused")]
    Refused { addr: String },
    #[error("connecting to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("could not connect to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Failure while requesting or reading a status report. Always fatal for the
/// connection it happened on.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("connection closed by status service")]
    Closed,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// One status report: field name to untouched value text (units included).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStatus(BTreeMap<String, String>);

impl RawStatus {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawStatus {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        RawStatus(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// An open NIS session. Dropping it closes the socket.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
}

/// Connects to and queries a single apcupsd instance.
#[derive(Debug, Clone)]
pub struct StatusClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl StatusClient {
    /// # Arguments
    ///
    /// * `host` - The hostname or IP address of the apcupsd server
    /// * `port` - The port number of the apcupsd NIS (default: 3551)
    /// * `timeout` - Bound on connecting, on sending a request and on reading its whole reply
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        StatusClient {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Open a connection to the NIS. Never retries.
    pub async fn connect(&self) -> Result<Connection, ConnectError> {
        let addr = self.addr();
        let stream = match timeout(self.timeout, TcpStream::connect(&addr)).await {
            Err(_) => {
                return Err(ConnectError::Timeout {
                    addr,
                    timeout: self.timeout,
                });
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(ConnectError::Refused { addr });
            }
            Ok(Err(source)) => return Err(ConnectError::Io { addr, source }),
            Ok(Ok(stream)) => stream,
        };
        if let Err(source) = stream.set_nodelay(true) {
            return Err(ConnectError::Io { addr, source });
        }

        Ok(Connection { stream })
    }

    /// Send the `status` command and read the reply up to the end marker.
    pub async fn fetch_status(&self, conn: &mut Connection) -> Result<RawStatus, FetchError> {
        within(self.timeout, conn.stream.write_all(CMD_STATUS)).await?;
        read_status(&mut conn.stream, self.timeout).await
    }
}

/// Read frames until the zero-length end marker and collect the key/value
/// lines into a [`RawStatus`]. The whole reply must arrive within `limit`.
pub async fn read_status<R>(reader: &mut R, limit: Duration) -> Result<RawStatus, FetchError>
where
    R: AsyncRead + Unpin,
{
    match timeout(limit, read_fields(reader)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(limit)),
    }
}

async fn read_fields<R>(reader: &mut R) -> Result<RawStatus, FetchError>
where
    R: AsyncRead + Unpin,
{
    let mut fields = BTreeMap::new();
    let mut lines = 0usize;

    while let Some(line) = read_frame(reader).await? {
        lines += 1;
        if lines > MAX_LINES {
            return Err(FetchError::Malformed(format!(
                "more than {MAX_LINES} lines without an end marker"
            )));
        }
        trace!("NIS line: {:?}", line);
        if let Some((key, value)) = parse_line(&line) {
            fields.insert(key, value);
        }
    }

    if fields.is_empty() {
        return Err(FetchError::Malformed(
            "reply contained no status fields".to_string(),
        ));
    }
    Ok(RawStatus(fields))
}

/// Read one length-prefixed frame. `None` is the end-of-reply marker.
async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, FetchError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await.map_err(read_error)? as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_LEN {
        return Err(FetchError::Malformed(format!("frame of {len} bytes")));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(read_error)?;
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| FetchError::Malformed("line is not valid UTF-8".to_string()))
}

/// Split a `KEY : VALUE` line on the first separator, trimming both halves.
fn parse_line(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once(SEP)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

async fn within<F, T>(limit: Duration, fut: F) -> Result<T, FetchError>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(read_error),
        Err(_) => Err(FetchError::Timeout(limit)),
    }
}

fn read_error(e: io::Error) -> FetchError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FetchError::Closed
    } else {
        FetchError::Io(e)
    }
}
