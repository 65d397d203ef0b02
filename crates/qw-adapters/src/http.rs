//! Outbound HTTP gateway over reqwest
//!
//! Transport failures are classed so the step executor can tell what is
//! retryable: connect, DNS, TLS, reset, and timeout each map to their own
//! error variant.

use qw_domain::HttpMethod;
use qw_ports::{GatewayRequest, GatewayResponse, HttpGateway, HttpGatewayError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use tracing::debug;

/// HTTP gateway backed by a shared reqwest client
pub struct ReqwestGateway {
    client: Client,
}

impl Default for ReqwestGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestGateway {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .user_agent("qawave-runner")
                .build()
                .unwrap_or_default(),
        }
    }
}

fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Options => Method::OPTIONS,
    }
}

fn classify(error: reqwest::Error) -> HttpGatewayError {
    if error.is_timeout() {
        return HttpGatewayError::Timeout;
    }
    let message = error.to_string();
    let lowered = message.to_ascii_lowercase();
    if error.is_connect() {
        if lowered.contains("dns") {
            return HttpGatewayError::Dns { message };
        }
        if lowered.contains("tls") || lowered.contains("certificate") {
            return HttpGatewayError::Tls { message };
        }
        return HttpGatewayError::Connect { message };
    }
    if error.is_builder() || error.is_request() {
        return HttpGatewayError::InvalidRequest { message };
    }
    HttpGatewayError::Reset { message }
}

impl HttpGateway for ReqwestGateway {
    async fn send(&self, request: GatewayRequest) -> Result<GatewayResponse, HttpGatewayError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                HttpGatewayError::InvalidRequest {
                    message: format!("invalid header name '{name}': {e}"),
                }
            })?;
            let value =
                HeaderValue::from_str(value).map_err(|e| HttpGatewayError::InvalidRequest {
                    message: format!("invalid header value: {e}"),
                })?;
            headers.insert(name, value);
        }

        let mut builder = self
            .client
            .request(to_method(request.method), &request.url)
            .headers(headers)
            .timeout(request.timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(classify)?.to_vec();

        debug!(url = %request.url, status, bytes = body.len(), "gateway response");
        Ok(GatewayResponse {
            status,
            headers,
            body,
        })
    }
}
