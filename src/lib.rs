//! Intercepting HTTP/HTTPS forward proxy.
//!
//! Clients configured to use a [`Proxy`] as their HTTP proxy get three
//! behaviors: plain proxying of absolute-form requests, opaque TCP tunnels
//! through `CONNECT`, and man-in-the-middle interception of tunneled TLS
//! flows, where the proxy terminates TLS with a per-host certificate minted
//! on the fly from a local CA and reads the cleartext requests inside.
//!
//! Each client request runs through a fixed pipeline (accept, auth,
//! connect, then request/response rounds). A [`ProxyHandler`]
//! implementation can hook any stage: serve local endpoints, require proxy
//! authentication, decide per host between tunneling and interception,
//! answer requests with canned responses, or rewrite upstream responses
//! before they are sent back.
//!
//! ```no_run
//! use http_intercept::{CaSigner, NoopHandler, Proxy, DEFAULT_CACHE_CAPACITY};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), http_intercept::Error> {
//!     let proxy: Proxy<NoopHandler, ()> = Proxy::builder()
//!         .ca(CaSigner::generate(DEFAULT_CACHE_CAPACITY)?)
//!         .handler(NoopHandler)
//!         .build();
//!     Arc::new(proxy)
//!         .start_proxy("127.0.0.1:8080".parse().unwrap(), std::future::pending())
//!         .await
//! }
//! ```

use log::{debug, info, warn};
use std::{
    future::Future,
    marker::PhantomData,
    net::SocketAddr,
    sync::{atomic::AtomicU64, Arc},
};
use tokio::net::TcpListener;
use typed_builder::TypedBuilder;

mod ca;
mod context;
mod error;
mod handler;
mod http_client;
mod serve;
mod session;
mod stream;
mod writer;

pub use ca::{CaSigner, DEFAULT_CACHE_CAPACITY};
pub use context::SessionContext;
pub use error::{is_peer_closed, Error, ErrorKind, RoundTripError};
pub use handler::{ConnectAction, NoopHandler, ProxyHandler, UserData};
pub use http_client::{default_round_tripper, gen_client, proxy_from_env, HttpClient, RoundTripper};
pub use serve::{in_memory_response, serve_in_memory, serve_response, ServeError, TransferEncoding};
pub use stream::{AsyncStream, HttpStream};
pub use writer::{ConnWriter, MemoryWriter, ResponseWriter};

pub use async_trait;
pub use hyper;
pub use rcgen;
pub use tokio_rustls;

/// The proxy: CA, round-tripper, policy knobs, and the embedder's handler.
///
/// Built once and shared (`Arc`) across every client connection. Handler
/// and knobs must not change once serving has started.
#[derive(TypedBuilder)]
pub struct Proxy<H, D = ()>
where
    H: ProxyHandler<D>,
    D: UserData,
{
    /// Callbacks observing and steering each session.
    pub handler: H,
    /// Signs per-host leaf certificates for interception.
    pub ca: CaSigner,
    /// Upstream client. Defaults to a hyper client that skips upstream
    /// certificate verification and honors `HTTPS_PROXY`/`HTTP_PROXY`.
    #[builder(default = http_client::default_round_tripper())]
    pub rt: Arc<dyn RoundTripper>,
    /// Frame intercepted responses with chunked transfer-encoding so one
    /// TLS stream can carry consecutive request/response rounds.
    #[builder(default = true)]
    pub mitm_chunked: bool,
    /// Scheme demanded in `Proxy-Authenticate` challenges.
    #[builder(default = String::from("Basic"))]
    pub auth_type: String,
    #[builder(default)]
    pub(crate) session_no: AtomicU64,
    #[builder(default)]
    _user_data: PhantomData<D>,
}

impl<H, D> Proxy<H, D>
where
    H: ProxyHandler<D>,
    D: UserData,
{
    /// Serves one client connection: reads requests off the stream and runs
    /// a session for each until the client goes away, an error ends the
    /// conversation, or a CONNECT takes the stream over.
    pub async fn serve_stream<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncStream + 'static,
    {
        let mut stream = HttpStream::new(Box::new(stream));
        loop {
            let req = match stream.read_request().await {
                Ok(Some(req)) => req,
                Ok(None) => return,
                Err(err) => {
                    if !is_peer_closed(&err) {
                        debug!("client request read failed: {err}");
                    }
                    return;
                }
            };
            let mut w = ConnWriter::new(stream);
            self.serve(&mut w, req).await;
            match w.into_stream() {
                Some(reclaimed) => stream = reclaimed,
                // Hijacked: the tunnel or TLS side owns the stream now.
                None => return,
            }
        }
    }

    /// Accepts and serves connections on `listen_addr` until
    /// `shutdown_signal` resolves.
    pub async fn start_proxy<F>(
        self: Arc<Self>,
        listen_addr: SocketAddr,
        shutdown_signal: F,
    ) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("proxy listening on {listen_addr}");
        tokio::pin!(shutdown_signal);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {peer}");
                        tokio::spawn(Arc::clone(&self).serve_stream(stream));
                    }
                    Err(err) => warn!("accept failed: {err}"),
                },
                _ = &mut shutdown_signal => {
                    info!("proxy shutting down");
                    return Ok(());
                }
            }
        }
    }
}
