use crate::{
    context::SessionContext,
    error::{is_peer_closed, ErrorKind, RoundTripError},
    handler::{ConnectAction, ProxyHandler, UserData},
    serve::{serve_in_memory, serve_response, ServeError, TransferEncoding},
    stream::HttpStream,
    writer::{ConnWriter, ResponseWriter},
    Proxy,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::FutureExt;
use http::{header, uri, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use hyper::{Body, Request};
use std::{any::Any, fmt, future::Future, panic::AssertUnwindSafe, sync::atomic::Ordering};
use tokio::{
    io::{copy, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::TlsAcceptor;

const NON_PROXY_BODY: &[u8] =
    b"This is a proxy server. Does not respond to non-proxy requests.";

enum RequestOutcome {
    /// A response was written (or attempted); `err` ends a MITM loop.
    Handled { err: bool },
    /// Nothing written, the request goes on to the upstream round trip.
    Continue(Request<Body>),
}

impl<H, D> Proxy<H, D>
where
    H: ProxyHandler<D>,
    D: UserData,
{
    /// Runs one proxy session: a single client request and everything it
    /// turns into (a served response, an opaque tunnel, or an interception
    /// loop over the hijacked stream).
    pub async fn serve(&self, w: &mut dyn ResponseWriter, r: Request<Body>) {
        let mut ctx = SessionContext::new(self.next_session_no());
        let outcome = AssertUnwindSafe(self.serve_session(&mut ctx, w, r))
            .catch_unwind()
            .await;
        if let Err(payload) = outcome {
            let err = CallbackPanic(panic_message(payload.as_ref()));
            self.handler
                .on_error(&ctx, "Serve", ErrorKind::Panic, Some(&err))
                .await;
            std::panic::resume_unwind(payload);
        }
    }

    async fn serve_session(
        &self,
        ctx: &mut SessionContext<D>,
        w: &mut dyn ResponseWriter,
        mut r: Request<Body>,
    ) {
        if self.do_accept(ctx, w, &mut r).await {
            return;
        }
        if self.do_auth(ctx, w, &r).await {
            return;
        }
        remove_proxy_headers(r.headers_mut());
        if self.do_connect(ctx, w, &r).await {
            return;
        }

        if ctx.connect_action == ConnectAction::Mitm {
            self.mitm_loop(ctx).await;
            return;
        }

        ctx.sub_session_no += 1;
        match self.do_request(ctx, w, r).await {
            RequestOutcome::Handled { .. } => {}
            RequestOutcome::Continue(r) => {
                let _ = self.do_response(ctx, w, r).await;
            }
        }
    }

    fn next_session_no(&self) -> u64 {
        self.session_no.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn do_accept(
        &self,
        ctx: &mut SessionContext<D>,
        w: &mut dyn ResponseWriter,
        r: &mut Request<Body>,
    ) -> bool {
        if r.version() != Version::HTTP_10 && r.version() != Version::HTTP_11 {
            self.handler
                .on_error(ctx, "Accept", ErrorKind::NotSupportHttpVer, None)
                .await;
            return true;
        }
        match guarded(self.handler.on_accept(ctx, w, r)).await {
            Ok(handled) => handled,
            Err(err) => {
                self.handler
                    .on_error(ctx, "Accept", ErrorKind::Panic, Some(&err))
                    .await;
                true
            }
        }
    }

    async fn do_auth(
        &self,
        ctx: &mut SessionContext<D>,
        w: &mut dyn ResponseWriter,
        r: &Request<Body>,
    ) -> bool {
        // Only genuine proxy requests carry proxy credentials.
        if r.method() != Method::CONNECT && r.uri().scheme().is_none() {
            return false;
        }
        if !self.handler.requires_auth() {
            return false;
        }
        let auth_type = if self.auth_type.is_empty() {
            "Basic"
        } else {
            self.auth_type.as_str()
        };

        let mut unauthorized = false;
        let presented = r
            .headers()
            .get(header::PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split_once(' '));
        if let Some((scheme, data)) = presented {
            if scheme == auth_type && scheme == "Basic" {
                unauthorized = true;
                if let Some((user, pass)) = decode_basic(data) {
                    match guarded(self.handler.on_auth(ctx, auth_type, &user, &pass)).await {
                        Ok(true) => return false,
                        Ok(false) => {}
                        Err(err) => {
                            self.handler
                                .on_error(ctx, "Auth", ErrorKind::Panic, Some(&err))
                                .await;
                            return true;
                        }
                    }
                }
            }
        }

        let mut body = String::from("Proxy Authentication Required");
        if unauthorized {
            body.push_str(" [Unauthorized]");
        }
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(auth_type) {
            headers.insert(header::PROXY_AUTHENTICATE, value);
        }
        if let Err(err) = serve_in_memory(
            w,
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            headers,
            body.as_bytes(),
        )
        .await
        {
            if !is_peer_closed(&err) {
                self.handler
                    .on_error(ctx, "Auth", ErrorKind::ResponseWrite, Some(&err))
                    .await;
            }
        }
        true
    }

    async fn do_connect(
        &self,
        ctx: &mut SessionContext<D>,
        w: &mut dyn ResponseWriter,
        r: &Request<Body>,
    ) -> bool {
        if r.method() != Method::CONNECT {
            return false;
        }
        let mut stream = match w.hijack() {
            Ok(stream) => stream,
            Err(err) => {
                self.handler
                    .on_error(ctx, "Connect", ErrorKind::NotSupportHijacking, Some(&err))
                    .await;
                return true;
            }
        };

        ctx.connect_action = ConnectAction::Proxy;
        let mut host = r
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (action, new_host) = match guarded(self.handler.on_connect(ctx, &host)).await {
            Ok(decision) => decision,
            Err(err) => {
                let _ = stream.shutdown().await;
                self.handler
                    .on_error(ctx, "Connect", ErrorKind::Panic, Some(&err))
                    .await;
                return true;
            }
        };
        if let Some(new_host) = new_host {
            if !new_host.is_empty() {
                host = new_host;
            }
        }
        if !has_port(&host) {
            host.push_str(":80");
        }
        ctx.connect_action = action;

        match action {
            ConnectAction::Proxy => {
                ctx.connect_host = host.clone();
                ctx.connect_request = Some(head_of(r));
                self.tunnel(ctx, stream, &host).await;
                true
            }
            ConnectAction::Mitm => {
                ctx.connect_host = host.clone();
                ctx.connect_request = Some(head_of(r));
                self.mitm_handshake(ctx, stream, &host).await
            }
            ConnectAction::None => {
                let _ = stream.shutdown().await;
                true
            }
        }
    }

    /// Opaque tunnel: answer the CONNECT, then shuttle bytes both ways
    /// until either side hangs up. Each leg half-closes its peer on
    /// completion so EOF propagates.
    async fn tunnel(&self, ctx: &SessionContext<D>, mut client: HttpStream, host: &str) {
        let remote = match TcpStream::connect(host).await {
            Ok(remote) => remote,
            Err(err) => {
                let _ = client.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await;
                let _ = client.shutdown().await;
                self.handler
                    .on_error(ctx, "Connect", ErrorKind::RemoteConnect, Some(&err))
                    .await;
                return;
            }
        };
        if let Err(err) = client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await {
            let _ = client.shutdown().await;
            if !is_peer_closed(&err) {
                self.handler
                    .on_error(ctx, "Connect", ErrorKind::ResponseWrite, Some(&err))
                    .await;
            }
            return;
        }

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut remote_read, mut remote_write) = remote.into_split();
        let upstream = tokio::spawn(async move {
            let result = copy(&mut client_read, &mut remote_write).await;
            let _ = remote_write.shutdown().await;
            result
        });
        let downstream = tokio::spawn(async move {
            let result = copy(&mut remote_read, &mut client_write).await;
            let _ = client_write.shutdown().await;
            result
        });
        let (up, down) = tokio::join!(upstream, downstream);
        if let Ok(Err(err)) = up {
            if !is_peer_closed(&err) {
                self.handler
                    .on_error(ctx, "Connect", ErrorKind::RequestRead, Some(&err))
                    .await;
            }
        }
        if let Ok(Err(err)) = down {
            if !is_peer_closed(&err) {
                self.handler
                    .on_error(ctx, "Connect", ErrorKind::ResponseWrite, Some(&err))
                    .await;
            }
        }
    }

    /// Signs the target host, answers the CONNECT, and turns the hijacked
    /// stream into a TLS server side. Returns `true` when the session is
    /// finished (failure); on success the stream is stored in the context
    /// and the interception loop takes over.
    async fn mitm_handshake(
        &self,
        ctx: &mut SessionContext<D>,
        mut client: HttpStream,
        host: &str,
    ) -> bool {
        let config = match self.ca.server_config(host) {
            Ok(config) => config,
            Err(err) => {
                let _ = client.shutdown().await;
                self.handler
                    .on_error(ctx, "Connect", ErrorKind::TlsSignHost, Some(&err))
                    .await;
                return true;
            }
        };
        if let Err(err) = client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await {
            let _ = client.shutdown().await;
            if !is_peer_closed(&err) {
                self.handler
                    .on_error(ctx, "Connect", ErrorKind::ResponseWrite, Some(&err))
                    .await;
            }
            return true;
        }
        match TlsAcceptor::from(config).accept(client).await {
            Ok(tls) => {
                ctx.hijacked_tls = Some(HttpStream::new(Box::new(tls)));
                false
            }
            Err(err) => {
                if !is_peer_closed(&err) {
                    self.handler
                        .on_error(ctx, "Connect", ErrorKind::TlsHandshake, Some(&err))
                        .await;
                }
                true
            }
        }
    }

    /// Serves requests read off the intercepted TLS stream, one at a time.
    /// With chunked framing on, the loop keeps going until the client stops;
    /// otherwise exactly one inner request is served.
    async fn mitm_loop(&self, ctx: &mut SessionContext<D>) {
        let cyclic = self.mitm_chunked;
        loop {
            let Some(req) = self.do_mitm(ctx).await else {
                break;
            };
            let Some(stream) = ctx.hijacked_tls.take() else {
                break;
            };
            let mut w = ConnWriter::new(stream);
            ctx.sub_session_no += 1;
            let stop = match self.do_request(ctx, &mut w, req).await {
                RequestOutcome::Handled { err } => err || !cyclic,
                RequestOutcome::Continue(req) => {
                    self.do_response(ctx, &mut w, req).await.is_err() || !cyclic
                }
            };
            ctx.hijacked_tls = w.into_stream();
            if stop {
                break;
            }
        }
        if let Some(mut tls) = ctx.hijacked_tls.take() {
            let _ = tls.shutdown().await;
        }
    }

    /// Reads one request from the intercepted stream and rewrites it to the
    /// absolute form of the tunnel target. `None` ends the loop.
    async fn do_mitm(&self, ctx: &mut SessionContext<D>) -> Option<Request<Body>> {
        let read = match ctx.hijacked_tls.as_mut() {
            Some(stream) => stream.read_request().await,
            None => return None,
        };
        let mut req = match read {
            Ok(Some(req)) => req,
            Ok(None) => return None,
            Err(err) => {
                if !is_peer_closed(&err) {
                    self.handler
                        .on_error(ctx, "Request", ErrorKind::RequestRead, Some(&err))
                        .await;
                }
                return None;
            }
        };

        if req.uri().scheme().is_some() {
            self.handler
                .on_error(ctx, "Request", ErrorKind::AbsUrlAfterConnect, None)
                .await;
            return None;
        }
        let rewritten = Uri::builder()
            .scheme(uri::Scheme::HTTPS)
            .authority(ctx.connect_host.as_str())
            .path_and_query(
                req.uri()
                    .path_and_query()
                    .cloned()
                    .unwrap_or_else(|| uri::PathAndQuery::from_static("/")),
            )
            .build();
        match rewritten {
            Ok(uri) => *req.uri_mut() = uri,
            Err(err) => {
                self.handler
                    .on_error(ctx, "Request", ErrorKind::RequestRead, Some(&err))
                    .await;
                return None;
            }
        }
        remove_proxy_headers(req.headers_mut());
        Some(req)
    }

    async fn do_request(
        &self,
        ctx: &mut SessionContext<D>,
        w: &mut dyn ResponseWriter,
        mut r: Request<Body>,
    ) -> RequestOutcome {
        if r.uri().scheme().is_none() {
            // A client speaking origin-form is not configured for a proxy.
            let result = serve_in_memory(
                w,
                StatusCode::INTERNAL_SERVER_ERROR,
                HeaderMap::new(),
                NON_PROXY_BODY,
            )
            .await;
            let err = result.is_err();
            if let Err(serve_err) = result {
                if !is_peer_closed(&serve_err) {
                    self.handler
                        .on_error(ctx, "Request", ErrorKind::ResponseWrite, Some(&serve_err))
                        .await;
                }
            }
            return RequestOutcome::Handled { err };
        }

        let canned = match guarded(self.handler.on_request(ctx, &mut r)).await {
            Ok(canned) => canned,
            Err(err) => {
                self.handler
                    .on_error(ctx, "Request", ErrorKind::Panic, Some(&err))
                    .await;
                return RequestOutcome::Handled { err: true };
            }
        };
        let Some(mut resp) = canned else {
            return RequestOutcome::Continue(r);
        };

        resp.extensions_mut().remove::<TransferEncoding>();
        if ctx.connect_action == ConnectAction::Mitm && self.mitm_chunked {
            resp.extensions_mut()
                .insert(TransferEncoding(vec!["chunked".into()]));
        }
        let result = serve_response(w, resp).await;
        let err = result.is_err();
        if let Err(serve_err) = result {
            self.report_serve_error(ctx, "Request", serve_err).await;
        }
        RequestOutcome::Handled { err }
    }

    async fn do_response(
        &self,
        ctx: &mut SessionContext<D>,
        w: &mut dyn ResponseWriter,
        r: Request<Body>,
    ) -> Result<(), ()> {
        let head = head_of(&r);
        let mut resp = match self.rt.round_trip(r).await {
            Ok(resp) => resp,
            Err(err) => {
                let report = match &err {
                    RoundTripError::Canceled => false,
                    RoundTripError::Transport(inner) => !is_peer_closed(inner.as_ref()),
                };
                if report {
                    self.handler
                        .on_error(ctx, "Response", ErrorKind::RoundTrip, Some(&err))
                        .await;
                }
                let result =
                    serve_in_memory(w, StatusCode::NOT_FOUND, HeaderMap::new(), b"").await;
                if let Err(serve_err) = &result {
                    if !is_peer_closed(serve_err) {
                        self.handler
                            .on_error(ctx, "Response", ErrorKind::ResponseWrite, Some(serve_err))
                            .await;
                    }
                }
                return result.map(|_| ()).map_err(|_| ());
            }
        };

        match guarded(self.handler.on_response(ctx, &head, &mut resp)).await {
            Ok(()) => {}
            Err(err) => {
                self.handler
                    .on_error(ctx, "Response", ErrorKind::Panic, Some(&err))
                    .await;
                return Err(());
            }
        }

        resp.extensions_mut().remove::<TransferEncoding>();
        if ctx.connect_action == ConnectAction::Mitm && self.mitm_chunked {
            resp.extensions_mut()
                .insert(TransferEncoding(vec!["chunked".into()]));
        }
        match serve_response(w, resp).await {
            Ok(()) => Ok(()),
            Err(serve_err) => {
                self.report_serve_error(ctx, "Response", serve_err).await;
                Err(())
            }
        }
    }

    async fn report_serve_error(
        &self,
        ctx: &SessionContext<D>,
        stage: &'static str,
        err: ServeError,
    ) {
        let kind = match &err {
            ServeError::UnsupportedTransferEncoding(_) => ErrorKind::UnsupportedTransferEncoding,
            _ => {
                if is_peer_closed(&err) {
                    return;
                }
                ErrorKind::ResponseWrite
            }
        };
        self.handler.on_error(ctx, stage, kind, Some(&err)).await;
    }
}

pub(crate) fn remove_proxy_headers(headers: &mut HeaderMap) {
    // Let the round-tripper negotiate content encodings itself.
    headers.remove(header::ACCEPT_ENCODING);
    headers.remove(HeaderName::from_static("proxy-connection"));
    headers.remove(header::PROXY_AUTHENTICATE);
    headers.remove(header::PROXY_AUTHORIZATION);
    // Connection is a single-hop header, RFC 2616 14.10.
    headers.remove(header::CONNECTION);
}

fn has_port(host: &str) -> bool {
    match host.rsplit_once(':') {
        Some((name, port)) => {
            !name.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

fn head_of(r: &Request<Body>) -> Request<()> {
    let mut head = Request::new(());
    *head.method_mut() = r.method().clone();
    *head.uri_mut() = r.uri().clone();
    *head.version_mut() = r.version();
    *head.headers_mut() = r.headers().clone();
    head
}

fn decode_basic(data: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(data.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn guarded<T>(fut: impl Future<Output = T>) -> Result<T, CallbackPanic> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| CallbackPanic(panic_message(payload.as_ref())))
}

#[derive(Debug)]
struct CallbackPanic(String);

impl fmt::Display for CallbackPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CallbackPanic {}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("panic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_detection() {
        assert!(has_port("example.com:443"));
        assert!(has_port("127.0.0.1:80"));
        assert!(!has_port("example.com"));
        assert!(!has_port("example.com:"));
        assert!(!has_port("example.com:http"));
    }

    #[test]
    fn basic_credentials_decode() {
        assert_eq!(
            decode_basic("dGVzdDoxMjM0"),
            Some(("test".into(), "1234".into()))
        );
        // Password may itself contain a colon.
        assert_eq!(decode_basic("YTpiOmM="), Some(("a".into(), "b:c".into())));
        assert_eq!(decode_basic("bm9jb2xvbg=="), None);
        assert_eq!(decode_basic("!!!"), None);
    }

    #[test]
    fn proxy_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, "gzip".parse().unwrap());
        headers.insert("proxy-connection", "keep-alive".parse().unwrap());
        headers.insert(header::PROXY_AUTHORIZATION, "Basic x".parse().unwrap());
        headers.insert(header::CONNECTION, "close".parse().unwrap());
        headers.insert(header::HOST, "example.com".parse().unwrap());
        remove_proxy_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::HOST));
    }
}
