// Upstream client implementation
// Relays authorized requests to the configured upstream and streams the answer back

use std::net::SocketAddr;

use axum::body::{Body, HttpBody};
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reqwest::{redirect, Client};
use tokio::time::Duration;

use super::{strip_hop_by_hop, Director, Upstream};

pub struct UpstreamClient {
    http_client: Client,
    director: Director,
}

impl UpstreamClient {
    pub fn new(upstream: Upstream) -> Result<Self, String> {
        let http_client = Client::builder()
            // Connection settings (reuse pooled connections to the single upstream)
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            // Redirects are the client's business, relay them as-is
            .redirect(redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            http_client,
            director: Director::new(upstream),
        })
    }

    pub fn director(&self) -> &Director {
        &self.director
    }

    /// Sends `request` to the upstream and relays status, headers and body.
    /// Neither body is buffered.
    ///
    /// Transport failures become 502 (504 on timeout) with an empty body.
    pub async fn forward(&self, request: Request, client_addr: Option<SocketAddr>) -> Response {
        let (parts, body) = request.into_parts();
        let url = self.director.rewrite(&parts.uri);
        let headers = self
            .director
            .outbound_headers(&parts.headers, client_addr.map(|a| a.ip()));

        // Streamed through as it arrives; an empty body is sent as such
        let body = if body.is_end_stream() {
            reqwest::Body::from(Vec::new())
        } else {
            reqwest::Body::wrap_stream(body.into_data_stream())
        };

        tracing::debug!("forward {} {}", parts.method, url);

        let result = self
            .http_client
            .request(parts.method, url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await;

        match result {
            Ok(upstream) => relay(upstream),
            Err(e) => {
                tracing::error!("Upstream request to {} failed: {}", url, e);
                if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT.into_response()
                } else {
                    StatusCode::BAD_GATEWAY.into_response()
                }
            }
        }
    }
}

/// Upstream response as-is, minus hop-by-hop headers. The body is streamed.
fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = strip_hop_by_hop(upstream.headers());

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
