// Upstream module - request rewriting and forwarding

pub mod client;

use std::net::IpAddr;

use axum::http::{header, HeaderMap, HeaderValue, Uri};
use reqwest::Url;

pub use client::UpstreamClient;

/// Headers that only describe the current connection and are never relayed.
static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The single host every request of a proxy is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    base: Url,
}

impl Upstream {
    /// Accepts `host:port` (forwarded over plain http) or an absolute
    /// `http(s)://` URL, whose path and query become a prefix for every request.
    pub fn parse(to: &str) -> Result<Self, String> {
        let to = to.trim();
        let base = if to.contains("://") {
            let url = Url::parse(to).map_err(|e| format!("upstream {:?}: {}", to, e))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(format!("upstream {:?}: unsupported scheme {}", to, url.scheme()));
            }
            url
        } else {
            let (host, port) = to
                .rsplit_once(':')
                .ok_or_else(|| format!("upstream {:?} is not host:port", to))?;
            if host.is_empty() {
                return Err(format!("upstream {:?} has no host", to));
            }
            port.parse::<u16>()
                .map_err(|e| format!("upstream {:?}: invalid port: {}", to, e))?;
            Url::parse(&format!("http://{}", to))
                .map_err(|e| format!("upstream {:?}: {}", to, e))?
        };

        if base.host_str().is_none() {
            return Err(format!("upstream {:?} has no host", to));
        }
        Ok(Self { base })
    }

    pub fn url(&self) -> &Url {
        &self.base
    }
}

/// Rewrites inbound requests so they address the upstream.
#[derive(Debug, Clone)]
pub struct Director {
    upstream: Upstream,
}

impl Director {
    pub fn new(upstream: Upstream) -> Self {
        Self { upstream }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Upstream scheme and authority, joined path, merged query.
    pub fn rewrite(&self, uri: &Uri) -> Url {
        let base = &self.upstream.base;
        let mut url = base.clone();
        url.set_path(&join_paths(base.path(), uri.path()));

        let query = merge_query(base.query().unwrap_or(""), uri.query().unwrap_or(""));
        url.set_query((!query.is_empty()).then_some(query.as_str()));
        url
    }

    /// Inbound headers minus `Host` and hop-by-hop headers, with the client
    /// appended to `X-Forwarded-For`. The transport sets `Host` from the target URL.
    pub fn outbound_headers(&self, inbound: &HeaderMap, client: Option<IpAddr>) -> HeaderMap {
        let mut headers = strip_hop_by_hop(inbound);
        headers.remove(header::HOST);

        if let Some(ip) = client {
            let forwarded = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{}, {}", prior, ip),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert("x-forwarded-for", value);
            }
        }
        headers
    }
}

/// Copy of `headers` without hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let connection_listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str())
            || connection_listed.iter().any(|listed| listed == name.as_str())
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Joins with exactly one slash between the two parts.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Concatenates when either side is empty, joins with `&` otherwise.
fn merge_query(upstream: &str, inbound: &str) -> String {
    if upstream.is_empty() || inbound.is_empty() {
        format!("{}{}", upstream, inbound)
    } else {
        format!("{}&{}", upstream, inbound)
    }
}
