use crate::stream::HttpStream;
use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use std::io;
use tokio::io::AsyncWriteExt;

/// Sink a session writes its response through.
///
/// Header mutation is buffered; implementations emit the head when the first
/// body chunk is written. `hijack` surrenders the raw client stream for
/// CONNECT handling and is unsupported unless the sink sits directly on a
/// client connection.
#[async_trait]
pub trait ResponseWriter: Send {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Stores the status code for the head; nothing is written yet.
    fn set_status(&mut self, status: StatusCode);

    /// Writes one body chunk, emitting the buffered head first.
    ///
    /// An empty chunk still forces the head out, which is how bodyless
    /// responses reach the wire.
    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Takes over the underlying client stream.
    fn hijack(&mut self) -> io::Result<HttpStream> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "hijacking not supported",
        ))
    }
}

/// [`ResponseWriter`] over a raw client byte stream.
///
/// Serializes `HTTP/1.1 <code> <reason>` plus the buffered headers on the
/// first body write. After an I/O failure the error is latched and every
/// later operation fails with it. The stream can be reclaimed with
/// [`ConnWriter::into_stream`] for connection reuse.
pub struct ConnWriter {
    stream: Option<HttpStream>,
    status: StatusCode,
    headers: HeaderMap,
    head_sent: bool,
    err: Option<(io::ErrorKind, String)>,
}

impl ConnWriter {
    pub fn new(stream: HttpStream) -> Self {
        ConnWriter {
            stream: Some(stream),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_sent: false,
            err: None,
        }
    }

    /// Returns the underlying stream, or `None` after a hijack.
    pub fn into_stream(self) -> Option<HttpStream> {
        self.stream
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.shutdown().await,
            None => Ok(()),
        }
    }

    fn latched(&self) -> Option<io::Error> {
        self.err
            .as_ref()
            .map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
    }

    async fn write_inner(&mut self, chunk: &[u8]) -> io::Result<()> {
        let head = if self.head_sent {
            None
        } else {
            self.head_sent = true;
            Some(render_head(self.status, &self.headers))
        };
        let stream = self.stream.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "client stream was hijacked")
        })?;
        if let Some(head) = head {
            stream.write_all(&head).await?;
        }
        if !chunk.is_empty() {
            stream.write_all(chunk).await?;
        }
        stream.flush().await
    }
}

#[async_trait]
impl ResponseWriter for ConnWriter {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let Some(err) = self.latched() {
            return Err(err);
        }
        match self.write_inner(chunk).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.err = Some((err.kind(), err.to_string()));
                Err(err)
            }
        }
    }

    fn hijack(&mut self) -> io::Result<HttpStream> {
        self.stream.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "client stream already hijacked")
        })
    }
}

/// In-memory [`ResponseWriter`] that records what a session would have sent.
#[derive(Default)]
pub struct MemoryWriter {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseWriter for MemoryWriter {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.status.get_or_insert(StatusCode::OK);
        self.body.extend_from_slice(chunk);
        Ok(())
    }
}

fn render_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    match status.canonical_reason() {
        Some(reason) => out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).as_bytes()),
        None => out.extend_from_slice(format!("HTTP/1.1 {}\r\n", status.as_u16()).as_bytes()),
    }
    for (name, value) in headers.iter() {
        out.extend_from_slice(title_case(name.as_str()).as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// `content-length` -> `Content-Length`, the casing most intermediaries
/// expect even though header names are case-insensitive.
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        out.push(if upper { c.to_ascii_uppercase() } else { c });
        upper = c == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header;
    use tokio::io::AsyncReadExt;

    fn pair() -> (ConnWriter, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (ConnWriter::new(HttpStream::new(Box::new(server))), client)
    }

    async fn collect(mut w: ConnWriter, mut client: tokio::io::DuplexStream) -> Vec<u8> {
        w.shutdown().await.unwrap();
        drop(w);
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn head_is_emitted_on_first_body_write() {
        let (mut w, client) = pair();
        w.set_status(StatusCode::NOT_FOUND);
        w.headers_mut()
            .insert(header::CONTENT_LENGTH, "5".parse().unwrap());
        w.write_body(b"hel").await.unwrap();
        w.write_body(b"lo").await.unwrap();

        let out = collect(w, client).await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
        // The head must appear exactly once.
        assert_eq!(text.matches("HTTP/1.1").count(), 1);
    }

    #[tokio::test]
    async fn empty_write_flushes_head() {
        let (mut w, client) = pair();
        w.set_status(StatusCode::NO_CONTENT);
        w.write_body(b"").await.unwrap();
        let out = collect(w, client).await;
        assert_eq!(out, b"HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[tokio::test]
    async fn unknown_status_code_has_no_reason() {
        let (mut w, client) = pair();
        w.set_status(StatusCode::from_u16(599).unwrap());
        w.write_body(b"").await.unwrap();
        let out = collect(w, client).await;
        assert!(out.starts_with(b"HTTP/1.1 599\r\n"));
    }

    #[tokio::test]
    async fn errors_are_latched() {
        let (mut w, client) = pair();
        drop(client);
        let first = w.write_body(b"x").await.unwrap_err();
        let second = w.write_body(b"y").await.unwrap_err();
        assert_eq!(first.kind(), second.kind());
    }

    #[tokio::test]
    async fn hijack_takes_the_stream_once() {
        let (mut w, _client) = pair();
        assert!(w.hijack().is_ok());
        assert!(w.hijack().is_err());
        assert!(w.write_body(b"x").await.is_err());
        assert!(w.into_stream().is_none());
    }

    #[test]
    fn title_casing() {
        assert_eq!(title_case("content-length"), "Content-Length");
        assert_eq!(title_case("proxy-authenticate"), "Proxy-Authenticate");
        assert_eq!(title_case("etag"), "Etag");
    }
}
