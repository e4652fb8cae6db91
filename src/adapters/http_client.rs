use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use hyper::{Request, Response, Version, header};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Upstream HTTP client adapter using Hyper with Rustls.
///
/// Responsibilities:
/// * Streams request and response bodies without buffering
/// * Forces the outgoing version to HTTP/1.1 (the upstream protocol)
/// * Converts between Hyper and Axum body types
///
/// Retries, timeouts and header rewriting live in the proxy engine; this
/// adapter is transport only.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, Body>(https_connector);

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
        if req.uri().host().is_none() {
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        }

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;

        let method_for_error = parts.method.clone();
        let uri_for_error = parts.uri.clone();
        let outgoing = Request::from_parts(parts, body);

        match self.client.request(outgoing).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();

                // The body is decoded while streaming; the server side
                // re-frames it, so the upstream framing header must go.
                parts.headers.remove(header::TRANSFER_ENCODING);

                Ok(Response::from_parts(parts, Body::new(hyper_body)))
            }
            Err(e) => Err(HttpClientError::ConnectionError(format!(
                "Request to {method_for_error} {uri_for_error} failed: {e}"
            ))),
        }
    }
}
