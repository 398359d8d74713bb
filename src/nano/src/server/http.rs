//! HTTP/1.1 wire handling: request parsing over `httparse`, response
//! serialisation with `Content-Length` for materialised bodies and chunked
//! transfer for stream bodies.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{bail, Context as _};
use nano_runtime::{HttpResponse, ResponseBody};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const IO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The raw `Host` header value, if any.
    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// The query string split off the request target.
    pub fn path_and_query(&self) -> (&str, Option<&str>) {
        match self.path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (self.path.as_str(), None),
        }
    }
}

pub fn read_request(stream: &mut TcpStream) -> anyhow::Result<ParsedRequest> {
    stream
        .set_read_timeout(Some(IO_TIMEOUT))
        .context("setting read timeout")?;
    stream
        .set_write_timeout(Some(IO_TIMEOUT))
        .context("setting write timeout")?;

    let mut buffer = Vec::with_capacity(4 * 1024);
    let mut chunk = [0u8; 4 * 1024];

    let (header_len, parsed) = loop {
        let read = stream.read(&mut chunk).context("reading request")?;
        if read == 0 {
            bail!("connection closed before a complete request");
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > MAX_HEADER_BYTES {
            bail!("request head exceeds {MAX_HEADER_BYTES} bytes");
        }

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buffer).context("parsing request head")? {
            httparse::Status::Complete(header_len) => {
                let method = request
                    .method
                    .context("request line missing a method")?
                    .to_string();
                let path = request
                    .path
                    .context("request line missing a target")?
                    .to_string();
                let headers: Vec<(String, String)> = request
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_ascii_lowercase(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();
                break (
                    header_len,
                    ParsedRequest {
                        method,
                        path,
                        headers,
                        body: Vec::new(),
                    },
                );
            }
            httparse::Status::Partial => continue,
        }
    };

    let mut parsed = parsed;
    let content_length: usize = parsed
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        bail!("request body exceeds {MAX_BODY_BYTES} bytes");
    }

    let mut body = buffer[header_len..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk).context("reading request body")?;
        if read == 0 {
            bail!("connection closed mid-body");
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);
    parsed.body = body;

    Ok(parsed)
}

/// Serialise and send a response. Framing headers are computed here; any
/// the handler set itself are dropped in favour of the actual body.
pub fn write_response(stream: &mut TcpStream, response: &HttpResponse) -> std::io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status, response.status_text
    );
    for (name, value) in &response.headers {
        if matches!(name.as_str(), "content-length" | "transfer-encoding" | "connection") {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("connection: close\r\n");

    match &response.body {
        ResponseBody::Full(body) => {
            head.push_str(&format!("content-length: {}\r\n\r\n", body.len()));
            stream.write_all(head.as_bytes())?;
            stream.write_all(body)?;
        }
        ResponseBody::Chunks(chunks) => {
            head.push_str("transfer-encoding: chunked\r\n\r\n");
            stream.write_all(head.as_bytes())?;
            for chunk in chunks {
                if chunk.is_empty() {
                    continue;
                }
                stream.write_all(format!("{:x}\r\n", chunk.len()).as_bytes())?;
                stream.write_all(chunk)?;
                stream.write_all(b"\r\n")?;
            }
            stream.write_all(b"0\r\n\r\n")?;
        }
    }
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_and_query_split() {
        let request = ParsedRequest {
            method: "DELETE".into(),
            path: "/admin/apps?hostname=a.local".into(),
            headers: vec![],
            body: vec![],
        };
        let (path, query) = request.path_and_query();
        assert_eq!(path, "/admin/apps");
        assert_eq!(query, Some("hostname=a.local"));
    }

    #[test]
    fn header_lookup_is_lowercased_at_parse_time() {
        let request = ParsedRequest {
            method: "GET".into(),
            path: "/".into(),
            headers: vec![("host".into(), "A.Local:8080".into())],
            body: vec![],
        };
        assert_eq!(request.host(), Some("A.Local:8080"));
    }
}
