//! Raw HTTP/1.1 message reading.
//!
//! Messages are read byte-for-byte off the wire (not through hyper's own
//! server framing) so that the `raw` field of a captured request or
//! response is always sufficient, on its own, to reconstruct and re-send
//! it. See [`crate::model::CapturedRequest`] / [`CapturedResponse`].

use crate::error::{ProxyError, ProxyResult};
use crate::model::{CapturedRequest, CapturedResponse, Value, ValueMap};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// A request line plus headers plus body, parsed from the wire.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A status line plus headers plus body, parsed from the wire.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub status: u16,
    pub reason: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Read one HTTP request off `reader`. Returns the exact bytes read
/// alongside the parsed form. Returns `Ok(None)` if the connection was
/// closed before any bytes arrived (a clean EOF between requests).
pub async fn read_request<R>(reader: &mut R) -> ProxyResult<Option<(Bytes, ParsedRequest)>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = BytesMut::new();
    let Some(start_line) = read_line(reader, &mut raw).await? else {
        return Ok(None);
    };

    let mut parts = start_line.splitn(3, ' ');
    let method = parts
        .next()
        .ok_or_else(|| ProxyError::Http("missing method".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| ProxyError::Http("missing request target".into()))?
        .to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let headers = read_headers(reader, &mut raw).await?;
    let body = read_body(reader, &headers, &mut raw).await?;

    Ok(Some((
        raw.freeze(),
        ParsedRequest {
            method,
            target,
            version,
            headers,
            body,
        },
    )))
}

/// Read one HTTP response off `reader`.
pub async fn read_response<R>(reader: &mut R) -> ProxyResult<(Bytes, ParsedResponse)>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = BytesMut::new();
    let start_line = read_line(reader, &mut raw)
        .await?
        .ok_or_else(|| ProxyError::Http("connection closed before status line".into()))?;

    let mut parts = start_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| ProxyError::Http("missing version".into()))?
        .to_string();
    let status: u16 = parts
        .next()
        .ok_or_else(|| ProxyError::Http("missing status code".into()))?
        .parse()
        .map_err(|_| ProxyError::Http("invalid status code".into()))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = read_headers(reader, &mut raw).await?;
    let body = read_body(reader, &headers, &mut raw).await?;

    Ok((
        raw.freeze(),
        ParsedResponse {
            status,
            reason,
            version,
            headers,
            body,
        },
    ))
}

/// Read a single `\r\n`-terminated line, appending everything read
/// (including the line terminator) to `raw`. Returns `None` on immediate
/// EOF (no bytes at all read), which signals a clean connection close.
async fn read_line<R>(reader: &mut R, raw: &mut BytesMut) -> ProxyResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    raw.extend_from_slice(&line);
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

async fn read_headers<R>(reader: &mut R, raw: &mut BytesMut) -> ProxyResult<Vec<(String, String)>>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    loop {
        let Some(line) = read_line(reader, raw).await? else {
            break;
        };
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(headers)
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

async fn read_body<R>(
    reader: &mut R,
    headers: &[(String, String)],
    raw: &mut BytesMut,
) -> ProxyResult<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let is_chunked = header_value(headers, "transfer-encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);

    if is_chunked {
        return read_chunked_body(reader, raw).await;
    }

    if let Some(len) = header_value(headers, "content-length") {
        let len: usize = len
            .trim()
            .parse()
            .map_err(|_| ProxyError::Http("invalid content-length".into()))?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        raw.extend_from_slice(&buf);
        return Ok(Bytes::from(buf));
    }

    Ok(Bytes::new())
}

async fn read_chunked_body<R>(reader: &mut R, raw: &mut BytesMut) -> ProxyResult<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        let size_line = read_line(reader, raw)
            .await?
            .ok_or_else(|| ProxyError::Http("connection closed mid chunk".into()))?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::Http("invalid chunk size".into()))?;

        if size == 0 {
            // trailer headers, terminated by an empty line
            loop {
                let Some(line) = read_line(reader, raw).await? else {
                    break;
                };
                if line.is_empty() {
                    break;
                }
            }
            break;
        }

        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await?;
        raw.extend_from_slice(&chunk);
        body.extend_from_slice(&chunk);

        // trailing CRLF after each chunk's data
        let mut crlf = [0u8; 2];
        read_exact_into(reader, &mut crlf, raw).await?;
    }
    Ok(body.freeze())
}

async fn read_exact_into<R>(reader: &mut R, buf: &mut [u8], raw: &mut BytesMut) -> ProxyResult<()>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(buf).await?;
    raw.extend_from_slice(buf);
    Ok(())
}

/// Fold a parsed request and its raw bytes into the persisted capture
/// shape, splitting query string, headers, cookies and (if form-encoded)
/// post params the way the original proxy's `FormRequestData` does.
pub fn build_captured_request(parsed: &ParsedRequest, raw: &Bytes, is_https: bool) -> CapturedRequest {
    let (path, query) = match parsed.target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (parsed.target.clone(), String::new()),
    };

    let get_params = grouped_values(url::form_urlencoded::parse(query.as_bytes()));

    let mut cookies = BTreeMap::new();
    let mut headers: ValueMap = ValueMap::new();

    let host = header_value(&parsed.headers, "host").unwrap_or("").to_string();
    headers.insert("Host".to_string(), Value::Single(host));

    let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in &parsed.headers {
        if name.eq_ignore_ascii_case("cookie") {
            for pair in value.split(';') {
                if let Some((k, v)) = pair.trim().split_once('=') {
                    cookies.insert(k.to_string(), v.to_string());
                }
            }
            continue;
        }
        by_name.entry(name.clone()).or_default().push(value.clone());
    }
    for (name, values) in by_name {
        headers.insert(name, Value::from_values(values));
    }

    let content_type = header_value(&parsed.headers, "content-type").unwrap_or("");
    let post_params = if content_type.starts_with("application/x-www-form-urlencoded") {
        grouped_values(url::form_urlencoded::parse(&parsed.body))
    } else {
        ValueMap::new()
    };

    CapturedRequest {
        method: parsed.method.clone(),
        path,
        get_params,
        headers,
        cookies,
        post_params,
        raw: String::from_utf8_lossy(raw).into_owned(),
        is_https,
    }
}

/// Fold a parsed response and its raw bytes into the persisted capture
/// shape, mirroring `FormResponseData`.
pub fn build_captured_response(parsed: &ParsedResponse, raw: &Bytes, is_https: bool) -> CapturedResponse {
    let mut headers: ValueMap = ValueMap::new();
    let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in &parsed.headers {
        if name.eq_ignore_ascii_case("cookie") {
            continue;
        }
        by_name.entry(name.clone()).or_default().push(value.clone());
    }
    for (name, values) in by_name {
        headers.insert(name, Value::from_values(values));
    }

    CapturedResponse {
        code: parsed.status,
        message: format!("{} {}", parsed.status, parsed.reason),
        headers,
        body: String::from_utf8_lossy(&parsed.body).into_owned(),
        raw: String::from_utf8_lossy(raw).into_owned(),
        is_https,
    }
}

/// Render a parsed request back into raw HTTP/1.1 bytes. Used to recompute
/// `raw` after the parsed form has been mutated (e.g. stripping a
/// hop-by-hop header) so the persisted capture never disagrees with what
/// was actually sent upstream.
pub fn render_request(parsed: &ParsedRequest) -> Bytes {
    let mut out = BytesMut::new();
    out.extend_from_slice(
        format!("{} {} {}\r\n", parsed.method, parsed.target, parsed.version).as_bytes(),
    );
    for (name, value) in &parsed.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&parsed.body);
    out.freeze()
}

/// Render a response assembled from a `hyper` client call (status, headers,
/// buffered body) back into raw HTTP/1.1 bytes, for the clear-text path
/// where the response was fetched through a proper HTTP client rather
/// than read byte-for-byte off a socket.
pub fn render_response(parts: &http::response::Parts, body: &Bytes) -> Bytes {
    let mut out = BytesMut::new();
    let reason = parts.status.canonical_reason().unwrap_or("");
    out.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", parts.status.as_u16(), reason).as_bytes(),
    );
    for (name, value) in parts.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out.freeze()
}

/// Build a [`CapturedResponse`] directly from hyper response parts and a
/// buffered body, for the clear-text path (mirrors [`build_captured_response`]
/// but skips re-parsing a status line that hyper already parsed for us).
pub fn captured_response_from_parts(
    parts: &http::response::Parts,
    body: &Bytes,
    raw: &Bytes,
    is_https: bool,
) -> CapturedResponse {
    let mut headers: ValueMap = ValueMap::new();
    let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in parts.headers.iter() {
        if name.as_str().eq_ignore_ascii_case("cookie") {
            continue;
        }
        by_name
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    for (name, values) in by_name {
        headers.insert(name, Value::from_values(values));
    }

    CapturedResponse {
        code: parts.status.as_u16(),
        message: format!(
            "{} {}",
            parts.status.as_u16(),
            parts.status.canonical_reason().unwrap_or("")
        ),
        headers,
        body: String::from_utf8_lossy(body).into_owned(),
        raw: String::from_utf8_lossy(raw).into_owned(),
        is_https,
    }
}

fn grouped_values<'a, I>(pairs: I) -> ValueMap
where
    I: Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
{
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in pairs {
        grouped.entry(k.into_owned()).or_default().push(v.into_owned());
    }
    grouped
        .into_iter()
        .map(|(k, v)| (k, Value::from_values(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_request_content_length() {
        let input = b"GET /foo?a=1&a=2 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = BufReader::new(Cursor::new(input.to_vec()));
        let (raw, parsed) = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.target, "/foo?a=1&a=2");
        assert_eq!(&parsed.body[..], b"hello");
        assert_eq!(&raw[..], &input[..]);
    }

    #[tokio::test]
    async fn test_read_request_chunked() {
        let input = b"POST /x HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(input.to_vec()));
        let (_raw, parsed) = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(&parsed.body[..], b"Wikipedia");
    }

    #[tokio::test]
    async fn test_read_request_eof_returns_none() {
        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        let result = read_request(&mut reader).await.unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_build_captured_request_splits_query_and_cookies() {
        let parsed = ParsedRequest {
            method: "GET".into(),
            target: "/p?a=1&b=2".into(),
            version: "HTTP/1.1".into(),
            headers: vec![
                ("Host".into(), "example.com".into()),
                ("Cookie".into(), "session=abc; theme=dark".into()),
            ],
            body: Bytes::new(),
        };
        let captured = build_captured_request(&parsed, &Bytes::from_static(b"raw"), false);
        assert_eq!(captured.cookies.get("session").unwrap(), "abc");
        assert_eq!(captured.cookies.get("theme").unwrap(), "dark");
        assert_eq!(captured.get_params.get("a").unwrap().first(), Some("1"));
    }

    #[test]
    fn test_render_request_drops_stripped_header() {
        let mut parsed = ParsedRequest {
            method: "GET".into(),
            target: "/p".into(),
            version: "HTTP/1.1".into(),
            headers: vec![
                ("Host".into(), "example.com".into()),
                ("Proxy-Connection".into(), "keep-alive".into()),
            ],
            body: Bytes::new(),
        };
        parsed
            .headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("proxy-connection"));
        let raw = render_request(&parsed);
        assert!(!String::from_utf8_lossy(&raw).contains("Proxy-Connection"));
        assert!(String::from_utf8_lossy(&raw).contains("Host: example.com"));
    }

    #[test]
    fn test_build_captured_request_form_post_params() {
        let parsed = ParsedRequest {
            method: "POST".into(),
            target: "/p".into(),
            version: "HTTP/1.1".into(),
            headers: vec![(
                "Content-Type".into(),
                "application/x-www-form-urlencoded".into(),
            )],
            body: Bytes::from_static(b"name=alice&name=bob"),
        };
        let captured = build_captured_request(&parsed, &Bytes::from_static(b"raw"), false);
        assert_eq!(
            captured.post_params.get("name").unwrap(),
            &Value::Multi(vec!["alice".into(), "bob".into()])
        );
    }
}
