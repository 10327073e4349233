//! Request/response exchange with the backend.
//!
//! The runtime only needs "send these bytes, get bytes back or an error";
//! [`HttpTransport`] does that with one POST per call over a pooled
//! keep-alive client.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Certificate, Client, StatusCode, Url};
use tracing::debug;

use crate::error::{HttpFsError, TransportError};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Performs one exchange. A non-success status is an error.
    async fn exchange(&self, body: Bytes) -> Result<Bytes, TransportError>;
}

/// Options for [`HttpTransport`].
#[derive(Clone, Debug, Default)]
pub struct HttpOptions {
    /// PEM CA certificate trusted in addition to the system roots.
    pub certificate: Option<Vec<u8>>,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
}

pub struct HttpTransport {
    client: Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(endpoint: &str, options: &HttpOptions) -> Result<Self, HttpFsError> {
        let endpoint = parse_endpoint(endpoint)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HttpFsError::InvalidConfig(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HttpFsError::InvalidConfig(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }

        let mut builder = Client::builder().default_headers(headers);
        if let Some(pem) = &options.certificate {
            if endpoint.scheme() == "https" {
                let cert = Certificate::from_pem(pem)
                    .map_err(|e| HttpFsError::InvalidConfig(format!("certificate: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
        }
        let client = builder.build().map_err(TransportError::from)?;

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Accepts only `http` and `https` URLs.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, HttpFsError> {
    let url = Url::parse(endpoint).map_err(|e| HttpFsError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(HttpFsError::InvalidEndpoint(format!(
            "{endpoint}: unsupported scheme {other}"
        ))),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn exchange(&self, body: Bytes) -> Result<Bytes, TransportError> {
        let len = body.len();
        let resp = self
            .client
            .post(self.endpoint.clone())
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        // drain the body either way so the connection goes back to the pool
        let payload = resp.bytes().await?;
        debug!(
            request_len = len,
            response_len = payload.len(),
            status = status.as_u16(),
            "exchange with {}",
            self.endpoint
        );
        if status != StatusCode::OK {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(payload)
    }
}
