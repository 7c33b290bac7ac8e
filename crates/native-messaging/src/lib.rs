//! Browser native-messaging plumbing.
//!
//! The browser talks to a native host over the host's stdio. Every message is
//! a UTF-8 JSON document preceded by its byte length as a `u32` in native byte
//! order. This crate provides:
//! - `write_message` / `read_message`: async framing over any tokio stream
//! - `exchange`: spawn a host from its manifest and run one request/response
//! - `manifest`: host manifest parsing and discovery in well-known directories

pub mod manifest;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use manifest::{HostManifest, find_host_manifest, load_host_manifest, manifest_dirs};

/// Largest message a host may send to the browser (1 MiB).
pub const MAX_INBOUND_BYTES: usize = 1024 * 1024;

/// Largest message the browser may send to a host (64 MiB).
pub const MAX_OUTBOUND_BYTES: usize = 64 * 1024 * 1024;

/// Errors raised while talking to a native host.
#[derive(Debug)]
pub enum FramingError {
    /// The host process could not be started
    Spawn(std::io::Error),
    /// Reading or writing the host's stdio failed
    Io(std::io::Error),
    /// The peer closed the stream before a complete message arrived
    Closed,
    /// A length prefix exceeded the allowed size for its direction
    TooLarge { len: usize, max: usize },
    /// The payload was not valid JSON for the expected type
    Json(serde_json::Error),
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::Spawn(e) => write!(f, "Failed to start native host: {e}"),
            FramingError::Io(e) => write!(f, "Native host I/O failed: {e}"),
            FramingError::Closed => write!(f, "Native host closed the stream"),
            FramingError::TooLarge { len, max } => {
                write!(f, "Message of {len} bytes exceeds the {max} byte limit")
            }
            FramingError::Json(e) => write!(f, "Invalid native message: {e}"),
        }
    }
}

impl std::error::Error for FramingError {}

impl From<std::io::Error> for FramingError {
    fn from(e: std::io::Error) -> Self {
        FramingError::Io(e)
    }
}

impl From<serde_json::Error> for FramingError {
    fn from(e: serde_json::Error) -> Self {
        FramingError::Json(e)
    }
}

/// Serialize `message` and write it with its length prefix, then flush.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_OUTBOUND_BYTES {
        return Err(FramingError::TooLarge {
            len: body.len(),
            max: MAX_OUTBOUND_BYTES,
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| FramingError::TooLarge {
        len: body.len(),
        max: MAX_OUTBOUND_BYTES,
    })?;
    writer.write_all(&len.to_ne_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message, rejecting payloads larger than `max_len`.
pub async fn read_message<R, T>(reader: &mut R, max_len: usize) -> Result<T, FramingError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FramingError::Closed),
        Err(e) => return Err(FramingError::Io(e)),
    }

    let len = u32::from_ne_bytes(prefix) as usize;
    if len > max_len {
        return Err(FramingError::TooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FramingError::Closed),
        Err(e) => return Err(FramingError::Io(e)),
    }

    Ok(serde_json::from_slice(&body)?)
}

/// Spawn the host described by `manifest`, send `request`, and read exactly one
/// response. The host receives `caller_origin` as its first argument, the same
/// way browsers identify the calling extension.
///
/// The host's stdin is closed after the response arrives and the process is
/// reaped; a host that lingers is killed when dropped.
pub async fn exchange<T, R>(
    manifest: &HostManifest,
    caller_origin: &str,
    request: &T,
) -> Result<R, FramingError>
where
    T: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let mut child = tokio::process::Command::new(&manifest.path)
        .arg(caller_origin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(FramingError::Spawn)?;

    let mut stdin = child.stdin.take().ok_or(FramingError::Closed)?;
    let mut stdout = child.stdout.take().ok_or(FramingError::Closed)?;

    write_message(&mut stdin, request).await?;
    let response = read_message(&mut stdout, MAX_INBOUND_BYTES).await;

    // Closing stdin is the host's signal to exit
    drop(stdin);
    let _ = child.start_kill();
    let _ = child.wait().await;

    response
}
