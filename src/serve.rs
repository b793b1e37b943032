use crate::writer::ResponseWriter;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use hyper::{body::HttpBody, Body, Response};
use std::io;
use thiserror::Error;
use time::{macros::format_description, OffsetDateTime};

/// Framing override carried in a response's extensions.
///
/// The wire `Transfer-Encoding` header inherited from upstream is always
/// dropped before serving; this extension is the serializer's instruction
/// instead. Sessions set it to `["chunked"]` for intercepted responses so
/// consecutive replies on one TLS stream stay individually framed.
#[derive(Debug, Clone, Default)]
pub struct TransferEncoding(pub Vec<String>);

/// Failure while writing a response to a sink.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("unsupported transfer encoding {0:?}")]
    UnsupportedTransferEncoding(Vec<String>),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("upstream body read failed")]
    Body(#[source] hyper::Error),
}

/// Builds a complete response held in memory.
///
/// Status text comes from the standard registry when known and
/// `Content-Length` is set to the body length.
pub fn in_memory_response(code: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Body> {
    let len = body.len();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = code;
    *resp.headers_mut() = headers;
    resp.headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    resp
}

/// Writes `resp` to the sink, at most one HTTP response per call.
///
/// Defaults `Date` and `Content-Type`, computes `Content-Length` for
/// identity bodies, and streams chunked framing when the
/// [`TransferEncoding`] extension asks for it. The body is consumed before
/// return whether or not writing succeeds.
pub async fn serve_response(
    w: &mut dyn ResponseWriter,
    resp: Response<Body>,
) -> Result<(), ServeError> {
    let (parts, mut body) = resp.into_parts();

    let encodings = parts
        .extensions
        .get::<TransferEncoding>()
        .map(|te| te.0.clone())
        .unwrap_or_default();
    let chunked = match encodings.as_slice() {
        [] => false,
        [enc] if enc == "chunked" => true,
        other => return Err(ServeError::UnsupportedTransferEncoding(other.to_vec())),
    };

    {
        let headers = w.headers_mut();
        for (name, value) in parts.headers.iter() {
            headers.append(name.clone(), value.clone());
        }
        if !headers.contains_key(header::DATE) {
            if let Some(date) = http_date() {
                headers.insert(header::DATE, date);
            }
        }
        if !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
        }
        headers.remove(header::TRANSFER_ENCODING);
        if chunked {
            headers.remove(header::CONTENT_LENGTH);
            headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        } else {
            match body.size_hint().exact() {
                Some(len) => {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                }
                None => {
                    headers.remove(header::CONTENT_LENGTH);
                }
            }
        }
    }
    w.set_status(parts.status);

    if chunked {
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(ServeError::Body)?;
            if chunk.is_empty() {
                continue;
            }
            let mut frame = format!("{:x}\r\n", chunk.len()).into_bytes();
            frame.extend_from_slice(&chunk);
            frame.extend_from_slice(b"\r\n");
            w.write_body(&frame).await?;
        }
        w.write_body(b"0\r\n\r\n\r\n").await?;
    } else {
        let mut wrote = false;
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(ServeError::Body)?;
            if chunk.is_empty() {
                continue;
            }
            w.write_body(&chunk).await?;
            wrote = true;
        }
        if !wrote {
            // Bodyless responses still need the head on the wire.
            w.write_body(&[]).await?;
        }
    }
    Ok(())
}

/// Builds and writes an in-memory response in one step.
pub async fn serve_in_memory(
    w: &mut dyn ResponseWriter,
    code: StatusCode,
    headers: HeaderMap,
    body: &[u8],
) -> Result<(), ServeError> {
    serve_response(
        w,
        in_memory_response(code, headers, Bytes::copy_from_slice(body)),
    )
    .await
}

fn http_date() -> Option<HeaderValue> {
    let now = OffsetDateTime::now_utc()
        .format(format_description!(
            "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
        ))
        .ok()?;
    HeaderValue::from_str(&now).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::MemoryWriter;

    #[tokio::test]
    async fn in_memory_round_trip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-test", HeaderValue::from_static("1"));
        let resp = in_memory_response(StatusCode::OK, headers, Bytes::from_static(b"abc"));

        let mut w = MemoryWriter::new();
        serve_response(&mut w, resp).await.unwrap();

        assert_eq!(w.status, Some(StatusCode::OK));
        assert_eq!(w.body, b"abc");
        assert_eq!(w.headers.get("x-test").unwrap(), "1");
        assert_eq!(w.headers.get(header::CONTENT_LENGTH).unwrap(), "3");
        assert!(w.headers.contains_key(header::DATE));
        assert_eq!(
            w.headers.get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn content_length_matches_body_bytes() {
        for body in [&b""[..], b"x", b"some longer payload"] {
            let mut w = MemoryWriter::new();
            serve_in_memory(&mut w, StatusCode::OK, HeaderMap::new(), body)
                .await
                .unwrap();
            assert_eq!(
                w.headers.get(header::CONTENT_LENGTH).unwrap(),
                &body.len().to_string()
            );
            assert_eq!(w.body.len(), body.len());
        }
    }

    #[tokio::test]
    async fn existing_defaults_are_kept() {
        let mut headers = HeaderMap::new();
        headers.insert(header::DATE, HeaderValue::from_static("Mon, 02 Jan 2006 15:04:05 GMT"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut w = MemoryWriter::new();
        serve_response(
            &mut w,
            in_memory_response(StatusCode::OK, headers, Bytes::from_static(b"{}")),
        )
        .await
        .unwrap();
        assert_eq!(
            w.headers.get(header::DATE).unwrap(),
            "Mon, 02 Jan 2006 15:04:05 GMT"
        );
        assert_eq!(w.headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
    }

    #[tokio::test]
    async fn chunked_framing_and_terminator() {
        let mut resp = Response::new(Body::from("hi"));
        resp.extensions_mut()
            .insert(TransferEncoding(vec!["chunked".into()]));

        let mut w = MemoryWriter::new();
        serve_response(&mut w, resp).await.unwrap();

        assert_eq!(w.body, b"2\r\nhi\r\n0\r\n\r\n\r\n");
        assert_eq!(w.headers.get(header::TRANSFER_ENCODING).unwrap(), "chunked");
        assert_eq!(w.headers.get(header::CONNECTION).unwrap(), "close");
        assert!(!w.headers.contains_key(header::CONTENT_LENGTH));
    }

    #[tokio::test]
    async fn upstream_transfer_encoding_header_is_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("gzip"));
        let mut w = MemoryWriter::new();
        serve_response(
            &mut w,
            in_memory_response(StatusCode::OK, headers, Bytes::from_static(b"x")),
        )
        .await
        .unwrap();
        assert!(!w.headers.contains_key(header::TRANSFER_ENCODING));
    }

    #[tokio::test]
    async fn unknown_transfer_encoding_is_rejected() {
        let mut resp = Response::new(Body::from("hi"));
        resp.extensions_mut()
            .insert(TransferEncoding(vec!["gzip".into(), "chunked".into()]));
        let mut w = MemoryWriter::new();
        let err = serve_response(&mut w, resp).await.unwrap_err();
        assert!(matches!(err, ServeError::UnsupportedTransferEncoding(_)));
        assert!(w.body.is_empty());
    }
}
