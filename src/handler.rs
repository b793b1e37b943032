use crate::context::SessionContext;
use crate::error::ErrorKind;
use crate::writer::ResponseWriter;
use async_trait::async_trait;
use hyper::{Body, Request, Response};

/// What to do with a CONNECT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectAction {
    /// Refuse: the hijacked stream is closed without a tunnel.
    #[default]
    None,
    /// Opaque TCP tunnel to the target.
    Proxy,
    /// Terminate TLS with a minted certificate and intercept.
    Mitm,
}

/// Marker for the embedder-defined per-session data slot.
pub trait UserData: Default + Send + Sync + 'static {}

impl UserData for () {}

/// Extension points of the proxy, one method per interception point.
///
/// Every method has a default that leaves the request to the built-in
/// pipeline, so embedders override only what they need.
#[async_trait]
pub trait ProxyHandler<D: UserData>: Send + Sync + 'static {
    /// Observes operational errors. `stage` names the pipeline stage, `kind`
    /// the failed operation. Peer disconnects are filtered out before this
    /// is called.
    async fn on_error(
        &self,
        _ctx: &SessionContext<D>,
        _stage: &'static str,
        _kind: ErrorKind,
        _err: Option<&(dyn std::error::Error + Send + Sync)>,
    ) {
    }

    /// Greets every incoming request before any proxying. Returning `true`
    /// means a response has been written and the session is done; useful for
    /// serving local endpoints off the proxy port.
    async fn on_accept(
        &self,
        _ctx: &mut SessionContext<D>,
        _w: &mut dyn ResponseWriter,
        _req: &mut Request<Body>,
    ) -> bool {
        false
    }

    /// Enables proxy authentication. When `true`, proxy requests without
    /// acceptable credentials are answered with 407 and [`Self::on_auth`]
    /// decides whether presented credentials pass.
    fn requires_auth(&self) -> bool {
        false
    }

    /// Verifies decoded credentials. Returning `true` authenticates the
    /// request and lets the pipeline continue.
    async fn on_auth(
        &self,
        _ctx: &mut SessionContext<D>,
        _auth_type: &str,
        _user: &str,
        _pass: &str,
    ) -> bool {
        false
    }

    /// Decides the CONNECT action for `host`. Returning a new host replaces
    /// the tunnel target.
    async fn on_connect(
        &self,
        _ctx: &mut SessionContext<D>,
        _host: &str,
    ) -> (ConnectAction, Option<String>) {
        (ConnectAction::Proxy, None)
    }

    /// Greets a proxied request before it goes upstream. A returned
    /// response is served to the client instead of round-tripping.
    async fn on_request(
        &self,
        _ctx: &mut SessionContext<D>,
        _req: &mut Request<Body>,
    ) -> Option<Response<Body>> {
        None
    }

    /// Observes the upstream response before it is written back; headers
    /// and body may be replaced here.
    async fn on_response(
        &self,
        _ctx: &mut SessionContext<D>,
        _req: &Request<()>,
        _resp: &mut Response<Body>,
    ) {
    }
}

/// Handler that accepts every default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl<D: UserData> ProxyHandler<D> for NoopHandler {}
