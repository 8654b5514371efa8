use anyhow::{Context, Result};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Body, Client, Response};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

/// Tokens without an `expires_in` are treated as valid for an hour.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// Exchanges a form grant (refresh token, JWT assertion) for a bearer token.
pub async fn request_token(client: &Client, token_url: &str, form: &[(&str, &str)]) -> Result<(String, Duration)> {
    let response = client
        .post(token_url)
        .form(form)
        .send()
        .await
        .with_context(|| format!("Token request to {} failed", token_url))?;
    let response = ensure_success(response, "token request").await?;
    let token: TokenResponse = response.json().await.context("Malformed token response")?;
    let lifetime = token
        .expires_in
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TOKEN_LIFETIME);
    Ok((token.access_token, lifetime))
}

/// Turns a non-2xx response into an error carrying the response body.
pub async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("{} failed with HTTP {}: {}", what, status, truncate(&body, 512))
}

/// Streams a response body into `path`, creating parent directories.
pub async fn stream_to_file(response: Response, path: &Path) -> Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory for download: {}", parent.display()))?;
    }
    let mut file = File::create(path)
        .await
        .with_context(|| format!("Failed to create destination file: {}", path.display()))?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Download stream interrupted")?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

/// Request body that streams the whole file.
pub async fn file_body(path: &Path) -> Result<(Body, u64)> {
    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open {} for upload", path.display()))?;
    let size = file.metadata().await?.len();
    Ok((Body::wrap_stream(ReaderStream::new(file)), size))
}

/// Reads up to `size` bytes, fewer only at end of file.
pub async fn read_chunk(file: &mut File, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// RFC 3986 unreserved characters stay as they are.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const UNRESERVED_PATH: &AsciiSet = &UNRESERVED.remove(b'/');

/// Percent-encodes everything outside the unreserved set, optionally
/// keeping `/` so object paths stay readable.
pub fn percent_encode(value: &str, keep_slash: bool) -> String {
    let set = if keep_slash { UNRESERVED_PATH } else { UNRESERVED };
    utf8_percent_encode(value, set).to_string()
}

/// JSON suitable for an HTTP header: non-ASCII escaped as `\uXXXX`.
pub fn header_safe_json(value: &serde_json::Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// `bytes start-end/total` for a chunk at `offset`.
pub fn content_range(offset: u64, len: u64, total: u64) -> String {
    format!("bytes {}-{}/{}", offset, offset + len.saturating_sub(1), total)
}

/// Drives a resumable upload session (Google Drive, Cloud Storage): each
/// chunk is PUT with a `Content-Range`, 308 asks for the next one and a
/// 2xx ends the session.
pub async fn resumable_upload(
    client: &Client,
    session_url: &str,
    path: &Path,
    size: u64,
    chunk_size: u64,
) -> Result<Response> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("Failed to open {} for upload", path.display()))?;
    let mut offset = 0u64;
    loop {
        let chunk = read_chunk(&mut file, chunk_size.max(1) as usize).await?;
        let len = chunk.len() as u64;
        let range = if size == 0 {
            "bytes */0".to_string()
        } else {
            content_range(offset, len, size)
        };
        let response = client
            .put(session_url)
            .header("Content-Length", len)
            .header("Content-Range", range)
            .body(chunk)
            .send()
            .await
            .context("Resumable upload request failed")?;
        if response.status().as_u16() == 308 {
            if len == 0 {
                anyhow::bail!("{} shrank during upload", path.display());
            }
            offset += len;
            continue;
        }
        return ensure_success(response, "resumable upload").await;
    }
}

/// `Location` header of a session-creating response.
pub fn location(response: &Response) -> Result<String> {
    response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .context("upload session response carried no Location header")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("backups/a b.tar.gz", true), "backups/a%20b.tar.gz");
        assert_eq!(percent_encode("backups/a.tar.gz", false), "backups%2Fa.tar.gz");
        assert_eq!(percent_encode("ü", false), "%C3%BC");
        assert_eq!(percent_encode("a~b-c_d.e", false), "a~b-c_d.e");
    }

    #[test]
    fn test_header_safe_json_escapes_non_ascii() {
        let header = header_safe_json(&json!({ "path": "/Sauvegardes/été.tar.gz" }));
        assert_eq!(header, r#"{"path":"/Sauvegardes/\u00e9t\u00e9.tar.gz"}"#);
        assert!(header.is_ascii());
    }

    #[test]
    fn test_content_range() {
        assert_eq!(content_range(0, 10, 25), "bytes 0-9/25");
        assert_eq!(content_range(20, 5, 25), "bytes 20-24/25");
    }
}
