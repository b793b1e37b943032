use crate::error::RoundTripError;
use async_trait::async_trait;
use hyper::{client::HttpConnector, Body, Client, Request, Response, Uri};
use hyper_proxy::{Intercept, Proxy as UpstreamProxy, ProxyConnector};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use std::{env, sync::Arc, time::SystemTime};

/// Upstream HTTP client: one operation, request in, response or error out.
///
/// The proxy never inspects how the round-tripper reaches the origin;
/// connection reuse and pooling are entirely its business.
#[async_trait]
pub trait RoundTripper: Send + Sync + 'static {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, RoundTripError>;
}

/// Default round-tripper, optionally routed through an upstream proxy.
#[derive(Clone)]
pub enum HttpClient {
    Proxy(Client<ProxyConnector<HttpsConnector<HttpConnector>>>),
    Https(Client<HttpsConnector<HttpConnector>>),
}

/// Builds the default client.
///
/// Upstream server certificates are deliberately not verified: intercepted
/// traffic is re-encrypted towards origins the client never sees, and
/// pinning every origin is the embedder's call, not ours.
pub fn gen_client(upstream_proxy: Option<UpstreamProxy>) -> HttpClient {
    let https = HttpsConnectorBuilder::new()
        .with_tls_config({
            let verifier = Arc::new(TrustAllCertVerifier);
            rustls::ClientConfig::builder()
                .with_safe_defaults()
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth()
        })
        .https_or_http()
        .enable_http1()
        .build();

    if let Some(proxy) = upstream_proxy {
        let connector = ProxyConnector::from_proxy_unsecured(https, proxy);
        HttpClient::Proxy(
            Client::builder()
                .http1_title_case_headers(true)
                .http1_preserve_header_case(true)
                .build(connector),
        )
    } else {
        HttpClient::Https(
            Client::builder()
                .http1_title_case_headers(true)
                .http1_preserve_header_case(true)
                .build(https),
        )
    }
}

/// Upstream proxy from the conventional environment variables, if any.
pub fn proxy_from_env() -> Option<UpstreamProxy> {
    let raw = ["https_proxy", "HTTPS_PROXY", "http_proxy", "HTTP_PROXY"]
        .iter()
        .find_map(|key| env::var(key).ok().filter(|v| !v.is_empty()))?;
    let uri: Uri = raw.parse().ok()?;
    Some(UpstreamProxy::new(Intercept::All, uri))
}

pub fn default_round_tripper() -> Arc<dyn RoundTripper> {
    Arc::new(gen_client(proxy_from_env()))
}

#[async_trait]
impl RoundTripper for HttpClient {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, RoundTripError> {
        let result = match self {
            HttpClient::Proxy(client) => client.request(req).await,
            HttpClient::Https(client) => client.request(req).await,
        };
        result.map_err(|err| {
            if err.is_canceled() {
                RoundTripError::Canceled
            } else {
                RoundTripError::Transport(Box::new(err))
            }
        })
    }
}

struct TrustAllCertVerifier;

impl ServerCertVerifier for TrustAllCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_plain_and_proxied_clients() {
        assert!(matches!(gen_client(None), HttpClient::Https(_)));

        let upstream = UpstreamProxy::new(Intercept::All, "http://127.0.0.1:9999".parse::<Uri>().unwrap());
        assert!(matches!(gen_client(Some(upstream)), HttpClient::Proxy(_)));
    }
}
