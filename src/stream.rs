use bytes::{Buf, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use hyper::{Body, Request};
use std::{
    cmp, io,
    pin::Pin,
    task::{self, Poll},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Byte stream a client session runs over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> AsyncStream for T {}

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 8 * 1024;

/// Buffered duplex over a boxed client stream.
///
/// Reads ahead into an internal buffer so HTTP/1.x heads can be parsed
/// incrementally; unconsumed bytes are replayed by the [`AsyncRead`] impl,
/// which keeps pipelined bytes intact when the stream is handed to a tunnel
/// or a TLS acceptor. Writes pass straight through.
pub struct HttpStream {
    inner: Box<dyn AsyncStream>,
    buf: BytesMut,
}

struct Head {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
}

impl HttpStream {
    pub fn new(inner: Box<dyn AsyncStream>) -> Self {
        HttpStream {
            inner,
            buf: BytesMut::new(),
        }
    }

    /// Reads one HTTP/1.x request, buffering its body.
    ///
    /// Returns `Ok(None)` on a clean end of stream between requests. An end
    /// of stream in the middle of a request surfaces as `UnexpectedEof`.
    pub async fn read_request(&mut self) -> io::Result<Option<Request<Body>>> {
        loop {
            if !self.buf.is_empty() {
                if let Some((len, head)) = parse_head(&self.buf)? {
                    self.buf.advance(len);
                    let body = self.read_body(&head).await?;
                    return Ok(Some(build_request(head, body)));
                }
                if self.buf.len() > MAX_HEAD_BYTES {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "request head too large",
                    ));
                }
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.inner.read_buf(&mut self.buf).await
    }

    async fn read_body(&mut self, head: &Head) -> io::Result<Bytes> {
        if head.method == Method::CONNECT {
            return Ok(Bytes::new());
        }
        if is_chunked(&head.headers) {
            return self.read_chunked_body().await;
        }
        match content_length(&head.headers)? {
            0 => Ok(Bytes::new()),
            n => self.read_exact_bytes(n).await,
        }
    }

    async fn read_exact_bytes(&mut self, n: usize) -> io::Result<Bytes> {
        let mut out = BytesMut::with_capacity(cmp::min(n, MAX_HEAD_BYTES));
        while out.len() < n {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            let take = cmp::min(n - out.len(), self.buf.len());
            out.extend_from_slice(&self.buf[..take]);
            self.buf.advance(take);
        }
        Ok(out.freeze())
    }

    async fn read_chunked_body(&mut self) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        loop {
            let line = self.read_line().await?;
            let size = chunk_size(&line)?;
            if size == 0 {
                // Trailer section ends at the first empty line.
                loop {
                    if self.read_line().await?.is_empty() {
                        return Ok(out.freeze());
                    }
                }
            }
            let chunk = self.read_exact_bytes(size).await?;
            out.extend_from_slice(&chunk);
            if !self.read_line().await?.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "missing chunk delimiter",
                ));
            }
        }
    }

    /// Reads up to the next LF, stripping the line terminator.
    async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut searched = 0;
        loop {
            if let Some(pos) = self.buf[searched..].iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(searched + pos + 1);
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(line.to_vec());
            }
            searched = self.buf.len();
            if searched > MAX_HEAD_BYTES {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
            }
            if self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }
}

fn parse_head(buf: &[u8]) -> io::Result<Option<(usize, Head)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
    };

    let invalid = |what: &str| io::Error::new(io::ErrorKind::InvalidData, what.to_string());
    let method: Method = req
        .method
        .ok_or_else(|| invalid("missing method"))?
        .parse()
        .map_err(|_| invalid("invalid method"))?;
    let uri: Uri = req
        .path
        .ok_or_else(|| invalid("missing request target"))?
        .parse()
        .map_err(|_| invalid("invalid request target"))?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut map = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| invalid("header name"))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| invalid("header value"))?;
        map.append(name, value);
    }
    Ok(Some((
        len,
        Head {
            method,
            uri,
            version,
            headers: map,
        },
    )))
}

fn build_request(head: Head, body: Bytes) -> Request<Body> {
    let mut req = Request::new(Body::from(body));
    *req.method_mut() = head.method;
    *req.uri_mut() = head.uri;
    *req.version_mut() = head.version;
    *req.headers_mut() = head.headers;
    req
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers.get_all(header::TRANSFER_ENCODING).iter().any(|v| {
        v.to_str()
            .map(|s| s.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    })
}

fn content_length(headers: &HeaderMap) -> io::Result<usize> {
    match headers.get(header::CONTENT_LENGTH) {
        None => Ok(0),
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid content-length")),
    }
}

fn chunk_size(line: &[u8]) -> io::Result<usize> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))?;
    let digits = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(digits, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

impl AsyncRead for HttpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buf.is_empty() {
            let copy_len = cmp::min(self.buf.len(), buf.remaining());
            buf.put_slice(&self.buf[..copy_len]);
            self.buf.advance(copy_len);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn stream_of(bytes: &'static [u8]) -> HttpStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut client = client;
        client.write_all(bytes).await.unwrap();
        client.shutdown().await.unwrap();
        HttpStream::new(Box::new(server))
    }

    #[tokio::test]
    async fn reads_origin_form_request_with_body() {
        let mut s =
            stream_of(b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello").await;
        let req = s.read_request().await.unwrap().unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().path(), "/submit");
        assert_eq!(req.version(), Version::HTTP_11);
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
        assert_eq!(&body[..], b"hello");
        assert!(s.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_connect_request_without_body() {
        let mut s = stream_of(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nleftover").await;
        let req = s.read_request().await.unwrap().unwrap();
        assert_eq!(req.method(), Method::CONNECT);
        assert_eq!(req.uri().authority().unwrap().as_str(), "example.com:443");

        // Bytes after the CONNECT head stay in the stream for the tunnel.
        let mut rest = Vec::new();
        s.read_to_end(&mut rest).await.unwrap();
        assert_eq!(&rest, b"leftover");
    }

    #[tokio::test]
    async fn reads_chunked_body() {
        let mut s = stream_of(
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await;
        let req = s.read_request().await.unwrap().unwrap();
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
        assert_eq!(&body[..], b"wikipedia");
    }

    #[tokio::test]
    async fn absolute_form_uri_is_preserved() {
        let mut s = stream_of(b"GET http://upstream/ok HTTP/1.1\r\nHost: upstream\r\n\r\n").await;
        let req = s.read_request().await.unwrap().unwrap();
        assert_eq!(req.uri().scheme_str(), Some("http"));
        assert_eq!(req.uri().host(), Some("upstream"));
    }

    #[tokio::test]
    async fn head_split_across_writes() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut s = HttpStream::new(Box::new(server));
        let task = tokio::spawn(async move {
            client.write_all(b"GET / HT").await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(b"TP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
            client
        });
        let req = s.read_request().await.unwrap().unwrap();
        assert_eq!(req.uri().path(), "/");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn eof_mid_request_is_unexpected() {
        let mut s = stream_of(b"GET / HTTP/1.1\r\nHos").await;
        let err = s.read_request().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
