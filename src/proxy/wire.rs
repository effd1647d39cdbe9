//! HTTP/1.1 wire framing
//!
//! The tunnel and the replay engine move exact wire bytes between peers, so
//! every read here keeps the raw bytes alongside the parsed view. Chunked
//! bodies are read with their framing intact; re-serializing a message yields
//! the bytes that were read.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Parsed request line and headers plus the exact head bytes
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Header fields in wire order, names as sent
    pub headers: Vec<(String, String)>,
    /// Exact bytes of the head, including the terminating blank line
    pub raw: Vec<u8>,
}

/// Parsed status line and headers plus the exact head bytes
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub raw: Vec<u8>,
}

/// One complete request as read off a stream
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub head: RequestHead,
    pub body: Vec<u8>,
}

/// One complete response as read off a stream
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub head: ResponseHead,
    pub body: Vec<u8>,
}

impl RawRequest {
    /// Exact serialized wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.head.raw.clone();
        out.extend_from_slice(&self.body);
        out
    }

    /// Body payload with any chunked framing decoded
    ///
    /// The tunnel path forwards `body` verbatim; the plain relay re-frames
    /// the message itself, so it must send and capture the payload bytes.
    pub fn decoded_body(&self) -> io::Result<Vec<u8>> {
        if is_chunked(&self.head.headers) {
            decode_chunked(&self.body)
        } else {
            Ok(self.body.clone())
        }
    }
}

impl RawResponse {
    /// Exact serialized wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.head.raw.clone();
        out.extend_from_slice(&self.body);
        out
    }

    /// Status line without the trailing CRLF, e.g. `200 OK`
    pub fn status_text(&self) -> String {
        if self.head.reason.is_empty() {
            self.head.code.to_string()
        } else {
            format!("{} {}", self.head.code, self.head.reason)
        }
    }
}

/// Case-insensitive lookup of the first value for `name`
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Read one CRLF-terminated line, appending its raw bytes to `raw`
async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    raw: &mut Vec<u8>,
) -> io::Result<String> {
    let start = raw.len();
    let n = reader.read_until(b'\n', raw).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-message",
        ));
    }
    let line = String::from_utf8_lossy(&raw[start..]);
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn read_header_fields<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    raw: &mut Vec<u8>,
) -> io::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader, raw).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        match line.split_once(':') {
            Some((name, value)) => {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
            None => return Err(invalid(format!("malformed header field: {line}"))),
        }
    }
}

/// Read a request head; `Ok(None)` when the peer closed before sending anything
pub async fn read_request_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<RequestHead>> {
    let mut raw = Vec::new();
    let n = reader.read_until(b'\n', &mut raw).await?;
    if n == 0 {
        return Ok(None);
    }

    let line = String::from_utf8_lossy(&raw).trim_end().to_string();
    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => return Err(invalid(format!("malformed request line: {line}"))),
    };

    let headers = read_header_fields(reader, &mut raw).await?;

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
        raw,
    }))
}

/// Read one complete request (head + body)
pub async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<RawRequest>> {
    let head = match read_request_head(reader).await? {
        Some(head) => head,
        None => return Ok(None),
    };

    let body = read_message_body(reader, &head.headers, false).await?;
    Ok(Some(RawRequest { head, body }))
}

/// Read one complete response (head + body)
pub async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<RawResponse> {
    let mut raw = Vec::new();
    let line = read_line(reader, &mut raw).await?;

    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|v| v.starts_with("HTTP/"))
        .ok_or_else(|| invalid(format!("malformed status line: {line}")))?
        .to_string();
    let code: u16 = parts
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| invalid(format!("malformed status code in: {line}")))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = read_header_fields(reader, &mut raw).await?;
    let body = read_message_body(reader, &headers, true).await?;

    Ok(RawResponse {
        head: ResponseHead {
            version,
            code,
            reason,
            headers,
            raw,
        },
        body,
    })
}

/// Read a message body according to its framing headers
///
/// Chunked bodies keep their framing bytes so the message re-serializes to
/// the exact wire form. A response with neither framing header is read to
/// EOF (close-delimited); a request without one has no body.
async fn read_message_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    headers: &[(String, String)],
    is_response: bool,
) -> io::Result<Vec<u8>> {
    if is_chunked(headers) {
        return read_chunked_raw(reader).await;
    }

    if let Some(value) = header(headers, "content-length") {
        let length: usize = value
            .parse()
            .map_err(|_| invalid(format!("bad content-length: {value}")))?;
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        return Ok(body);
    }

    if is_response {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;
        return Ok(body);
    }

    Ok(Vec::new())
}

/// Whether the framing headers declare a chunked body
pub fn is_chunked(headers: &[(String, String)]) -> bool {
    header(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

/// Decode a chunked body captured with its framing into the payload bytes
pub fn decode_chunked(raw: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let line_end = raw[pos..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| invalid("truncated chunk size line"))?;
        let line = String::from_utf8_lossy(&raw[pos..pos + line_end]);
        let size_hex = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| invalid(format!("bad chunk size: {line}")))?;
        pos += line_end + 2;

        if size == 0 {
            return Ok(out);
        }
        if pos + size + 2 > raw.len() {
            return Err(invalid("truncated chunk"));
        }
        out.extend_from_slice(&raw[pos..pos + size]);
        pos += size + 2;
    }
}

/// Read a chunked body including all framing bytes (sizes, CRLFs, trailers)
async fn read_chunked_raw<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut raw = Vec::new();
    loop {
        let size_line = read_line(reader, &mut raw).await?;
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| invalid(format!("bad chunk size: {size_line}")))?;

        if size == 0 {
            // Trailer section up to and including the final blank line.
            loop {
                let line = read_line(reader, &mut raw).await?;
                if line.is_empty() {
                    return Ok(raw);
                }
            }
        }

        let start = raw.len();
        raw.resize(start + size + 2, 0);
        reader.read_exact(&mut raw[start..]).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_request_with_content_length_body() {
        let wire = b"POST /login HTTP/1.1\r\nHost: example.com\r\nContent-Length: 9\r\n\r\nuser=abc&";
        let mut reader = BufReader::new(Cursor::new(wire.to_vec()));

        let request = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(request.head.method, "POST");
        assert_eq!(request.head.target, "/login");
        assert_eq!(request.body, b"user=abc&");
        assert_eq!(request.to_bytes(), wire.to_vec());
    }

    #[tokio::test]
    async fn eof_before_request_is_none() {
        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_response_with_content_length() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Test: yes\r\n\r\nhello";
        let mut reader = BufReader::new(Cursor::new(wire.to_vec()));

        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.head.code, 200);
        assert_eq!(response.head.reason, "OK");
        assert_eq!(header(&response.head.headers, "x-test"), Some("yes"));
        assert_eq!(response.body, b"hello");
        assert_eq!(response.to_bytes(), wire.to_vec());
        assert_eq!(response.status_text(), "200 OK");
    }

    #[tokio::test]
    async fn chunked_body_keeps_framing() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(wire.to_vec()));

        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.to_bytes(), wire.to_vec());
        assert!(response.body.starts_with(b"5\r\nhello"));
    }

    #[tokio::test]
    async fn chunked_request_decodes_to_payload_bytes() {
        let wire =
            b"POST /up HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(wire.to_vec()));

        let request = read_request(&mut reader).await.unwrap().unwrap();
        // Framing survives in the raw view, the decoded view is the payload.
        assert_eq!(request.to_bytes(), wire.to_vec());
        assert_eq!(request.decoded_body().unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn close_delimited_response_reads_to_eof() {
        let wire = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\npartial body until close";
        let mut reader = BufReader::new(Cursor::new(wire.to_vec()));

        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.body, b"partial body until close");
    }

    #[tokio::test]
    async fn malformed_request_line_is_an_error() {
        let mut reader = BufReader::new(Cursor::new(b"NONSENSE\r\n\r\n".to_vec()));
        assert!(read_request(&mut reader).await.is_err());
    }
}
