//! Request/response exchange over one transport.
//!
//! Both transports carry one JSON request and one JSON response per call.
//! On a Unix socket each message is a single line terminated by `\n`; over
//! HTTP the request is the POST body and the response the reply body.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use pipeline::ExtensionRequest;

/// Largest response accepted, in bytes.
pub const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

/// Transport-level failures. Timeouts are applied by the caller.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("i/o failed: {0}")]
    Io(String),

    #[error("service answered HTTP {0}")]
    Status(u16),

    #[error("response exceeds {MAX_RESPONSE_BYTES} bytes")]
    TooLarge,

    #[error("connection closed before a response was received")]
    Closed,
}

/// Sends `request` on the socket at `path` and reads one response line.
pub async fn unix_exchange(path: &Path, request: &ExtensionRequest) -> Result<Vec<u8>, TransportError> {
    let mut stream = UnixStream::connect(path)
        .await
        .map_err(|e| TransportError::Connect(format!("{}: {e}", path.display())))?;

    let mut line = serde_json::to_vec(request).map_err(|e| TransportError::Io(e.to_string()))?;
    line.push(b'\n');
    stream
        .write_all(&line)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    stream.flush().await.map_err(|e| TransportError::Io(e.to_string()))?;

    let mut reader = BufReader::new(stream);
    let mut response = Vec::new();
    loop {
        let buf = reader.fill_buf().await.map_err(|e| TransportError::Io(e.to_string()))?;
        if buf.is_empty() {
            break;
        }
        match buf.iter().position(|b| *b == b'\n') {
            Some(end) => {
                response.extend_from_slice(&buf[..end]);
                reader.consume(end + 1);
                return Ok(response);
            }
            None => {
                let n = buf.len();
                response.extend_from_slice(buf);
                reader.consume(n);
            }
        }
        if response.len() > MAX_RESPONSE_BYTES {
            return Err(TransportError::TooLarge);
        }
    }
    if response.is_empty() {
        return Err(TransportError::Closed);
    }
    Ok(response)
}

/// POSTs `request` to `url` and returns the reply body.
pub async fn http_exchange(
    http: &reqwest::Client,
    url: &reqwest::Url,
    request: &ExtensionRequest,
) -> Result<Vec<u8>, TransportError> {
    let response = http
        .post(url.clone())
        .json(request)
        .send()
        .await
        .map_err(|e| TransportError::Connect(e.without_url().to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }
    if response
        .content_length()
        .is_some_and(|len| len > MAX_RESPONSE_BYTES as u64)
    {
        return Err(TransportError::TooLarge);
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| TransportError::Io(e.without_url().to_string()))?;
    if body.len() > MAX_RESPONSE_BYTES {
        return Err(TransportError::TooLarge);
    }
    Ok(body.to_vec())
}
