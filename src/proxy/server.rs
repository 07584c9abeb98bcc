use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tower_http::add_extension::AddExtension;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::proxy::config::ProxyConfig;
use crate::proxy::middleware::{self, auth, Authorizer, Decision};
use crate::proxy::router::{DispatchTable, Handler, Resolution};
use crate::proxy::security::{SecretSource, TokenVerifier};
use crate::proxy::upstream::UpstreamClient;

const INIT_LOG: &str = "initialized and proxy started on:";

/// Shared, read-only state of one proxy listener
#[derive(Clone)]
pub struct AppState {
    pub table: Arc<DispatchTable>,
    pub authorizer: Arc<Authorizer>,
    pub upstream: Arc<UpstreamClient>,
}

impl AppState {
    pub fn new(config: &ProxyConfig, secret: SecretSource) -> Result<Self, String> {
        config.validate()?;
        let table = DispatchTable::compile(config)?;
        let upstream = UpstreamClient::new(config.upstream()?)?;
        let authorizer = Authorizer::new(
            TokenVerifier::new(secret),
            config.connect.header_prefix.clone(),
        );

        Ok(Self {
            table: Arc::new(table),
            authorizer: Arc::new(authorizer),
            upstream: Arc::new(upstream),
        })
    }
}

/// Every request goes through the precompiled dispatch table; there are no
/// other routes.
pub fn proxy_router(state: AppState) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn dispatch(State(state): State<AppState>, mut request: Request) -> Response {
    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let resolution = state.table.resolve(&method, &path);
    if !matches!(resolution, Resolution::Matched { .. }) {
        if let Some(location) = state.table.trailing_slash_redirect(&method, &path) {
            debug!("{} {}: redirect to {}", method, path, location);
            return trailing_slash_redirect(&method, location, &request);
        }
    }

    let access = match resolution {
        Resolution::Matched {
            handler: Handler::Preflight,
            ..
        } => return middleware::preflight_response(request.headers()),
        Resolution::Matched {
            handler: Handler::Authorize(access),
            pattern,
        } => {
            debug!("{} {} matched {}", method, path, pattern);
            access.clone()
        }
        Resolution::MethodNotAllowed(allowed) => {
            debug!("{} {}: method not allowed", method, path);
            let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
            let allow = allowed
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = HeaderValue::from_str(&allow) {
                response.headers_mut().insert(header::ALLOW, value);
            }
            middleware::apply_cors_headers(request.headers(), response.headers_mut());
            return response;
        }
        Resolution::NotFound => {
            debug!("{} {}: no route", method, path);
            let mut response = StatusCode::NOT_FOUND.into_response();
            middleware::apply_cors_headers(request.headers(), response.headers_mut());
            return response;
        }
    };

    let response_headers = auth::response_headers(&access, request.headers());

    let mut response = match state.authorizer.authorize(request.headers_mut(), &access) {
        Decision::Allow { claims } => {
            debug!(
                "ALLOW {} {} ({} claims)",
                method,
                path,
                claims.as_ref().map_or(0, |c| c.len())
            );
            state.upstream.forward(request, client_addr).await
        }
        Decision::Deny(reason) => {
            info!("ACCESS DENIED: {} {}: {}", method, path, reason);
            StatusCode::UNAUTHORIZED.into_response()
        }
    };

    response.headers_mut().extend(response_headers);
    response
}

/// 301 for GET, 308 otherwise so the method and body are kept. The query is carried over.
fn trailing_slash_redirect(method: &Method, location: String, request: &Request) -> Response {
    let status = if *method == Method::GET {
        StatusCode::MOVED_PERMANENTLY
    } else {
        StatusCode::PERMANENT_REDIRECT
    };
    let location = match request.uri().query() {
        Some(query) => format!("{}?{}", location, query),
        None => location,
    };

    let mut response = status.into_response();
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    middleware::apply_cors_headers(request.headers(), response.headers_mut());
    response
}

/// One bound proxy listener, ready to serve.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    app: Router,
}

impl ProxyServer {
    /// Compiles the route table and binds `0.0.0.0:<port of connect.from>`.
    pub async fn bind(config: &ProxyConfig, secret: SecretSource) -> Result<Self, String> {
        let state = AppState::new(config, secret)?;
        let upstream_url = state.upstream.director().upstream().url().clone();
        let app = proxy_router(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port()?));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| format!("Failed to bind address {}: {}", addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to read local address: {}", e))?;

        info!("{} {} -> {}", INIT_LOG, local_addr, upstream_url);

        Ok(Self {
            listener,
            local_addr,
            app,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop, one task per connection. Only returns on a listener failure.
    pub async fn serve(self) -> Result<(), String> {
        use hyper::server::conn::http1;
        use hyper_util::rt::TokioIo;
        use hyper_util::service::TowerToHyperService;

        let mut backoff = Duration::from_millis(5);
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    backoff = Duration::from_millis(5);
                    let io = TokioIo::new(stream);
                    let service = TowerToHyperService::new(AddExtension::new(
                        self.app.clone(),
                        ConnectInfo(peer),
                    ));

                    tokio::task::spawn(async move {
                        if let Err(err) = http1::Builder::new()
                            .serve_connection(io, service)
                            .await
                        {
                            debug!("Connection handling ended or error: {:?}", err);
                        }
                    });
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(
                        "Failed to accept connection on {}: {}; retrying in {:?}",
                        self.local_addr, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
                Err(e) => {
                    error!("Listener on {} failed: {}", self.local_addr, e);
                    return Err(format!("listener on {} failed: {}", self.local_addr, e));
                }
            }
        }
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Runs every proxy until one of them fails.
///
/// All proxies but the first are bound and served on their own tasks; the
/// first is served on the calling task. The first listener error, from any
/// proxy, is returned.
pub async fn run(proxies: Vec<ProxyConfig>, secret: SecretSource) -> Result<(), String> {
    let mut proxies = proxies.into_iter();
    let first = proxies
        .next()
        .ok_or_else(|| "no proxies configured".to_string())?;

    let mut others = JoinSet::new();
    for proxy in proxies {
        let secret = secret.clone();
        others.spawn(async move {
            debug!("start proxy {} -> {}", proxy.connect.from, proxy.connect.to);
            ProxyServer::bind(&proxy, secret).await?.serve().await
        });
    }

    let primary = async {
        debug!("start proxy {} -> {}", first.connect.from, first.connect.to);
        ProxyServer::bind(&first, secret).await?.serve().await
    };

    tokio::select! {
        result = primary => result,
        Some(joined) = others.join_next() => match joined {
            Ok(Ok(())) => Err("proxy listener stopped".to_string()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(format!("proxy task failed: {}", e)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::config::{AccessDefinition, Claim, Connect, Route};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SECRET: &[u8] = b"shhhhh";
    const SAMPLE_RESPONSE: &str = "valid return value";

    struct StubUpstream {
        addr: SocketAddr,
        hits: Arc<AtomicUsize>,
    }

    /// Answers 200 with a fixed body and reports the identity headers it saw.
    async fn spawn_upstream() -> StubUpstream {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().fallback(move |req: Request| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let seen = |name: &str| {
                    req.headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string()
                };
                (
                    StatusCode::OK,
                    [
                        ("x-seen-role", seen("x-session-role")),
                        ("x-seen-foo", seen("x-session-foo")),
                        ("x-seen-query", req.uri().query().unwrap_or("-").to_string()),
                    ],
                    SAMPLE_RESPONSE,
                )
            }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        StubUpstream { addr, hits }
    }

    fn route(pattern: &str, methods: &[&str], open: bool, claims: &[(&str, &[&str])]) -> Route {
        Route {
            pattern: pattern.to_string(),
            allow: AccessDefinition {
                methods: methods.iter().map(|m| m.to_string()).collect(),
                open,
                claims: claims
                    .iter()
                    .map(|(key, values)| Claim {
                        key: key.to_string(),
                        value: values.iter().map(|v| v.to_string()).collect(),
                    })
                    .collect(),
                cache_control: None,
            },
        }
    }

    fn config(to: SocketAddr) -> ProxyConfig {
        let roles: &[&str] = &["customer", "admin", "support"];
        let mut cars_get = route("/cars/*path", &["GET"], true, &[]);
        cars_get.allow.cache_control = Some("no-store".into());

        ProxyConfig {
            connect: Connect {
                from: "127.0.0.1:0".into(),
                to: to.to_string(),
                header_prefix: "X-Session-".into(),
            },
            routes: vec![
                route(
                    "/cars/*path",
                    &["POST", "PUT", "DELETE"],
                    false,
                    &[("role", roles), ("foo", &["bar"])],
                ),
                cars_get,
                route("/config/*configs", &["GET"], true, &[("role", roles)]),
                route("/images", &["GET"], false, &[]),
            ],
        }
    }

    async fn start_proxy(upstream: &StubUpstream) -> String {
        let server = ProxyServer::bind(&config(upstream.addr), SecretSource::from_bytes(SECRET))
            .await
            .unwrap();
        let port = server.local_addr().port();
        tokio::spawn(server.serve());
        format!("http://127.0.0.1:{}", port)
    }

    fn token(claims: Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn expiring(mut claims: Value) -> Value {
        claims["exp"] = json!(chrono::Utc::now().timestamp() + 60);
        claims
    }

    #[tokio::test]
    async fn test_closed_route_without_token_is_401() {
        let upstream = spawn_upstream().await;
        let proxy = start_proxy(&upstream).await;

        let res = reqwest::Client::new()
            .post(format!("{}/cars/1", proxy))
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.headers()["access-control-allow-origin"], "*");
        assert!(res.text().await.unwrap().is_empty());
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_route_without_token_round_trips() {
        let upstream = spawn_upstream().await;
        let proxy = start_proxy(&upstream).await;

        let res = reqwest::get(format!("{}/cars/1?color=red", proxy))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["x-seen-role"], "-");
        assert_eq!(res.headers()["x-seen-query"], "color=red");
        assert_eq!(res.headers()["cache-control"], "no-store");
        assert_eq!(res.headers()["access-control-allow-origin"], "*");
        assert_eq!(res.text().await.unwrap(), SAMPLE_RESPONSE);
    }

    #[tokio::test]
    async fn test_valid_token_forwards_claim_headers() {
        let upstream = spawn_upstream().await;
        let proxy = start_proxy(&upstream).await;

        let res = reqwest::Client::new()
            .put(format!("{}/cars/7", proxy))
            .bearer_auth(token(expiring(json!({"foo": "bar", "role": "guest"}))))
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        // every claim is forwarded, not only the one that matched
        assert_eq!(res.headers()["x-seen-foo"], "bar");
        assert_eq!(res.headers()["x-seen-role"], "guest");
        assert_eq!(res.text().await.unwrap(), SAMPLE_RESPONSE);
    }

    #[tokio::test]
    async fn test_open_route_claims_policy() {
        let upstream = spawn_upstream().await;
        let proxy = start_proxy(&upstream).await;
        let client = reqwest::Client::new();

        let admin = client
            .get(format!("{}/config/app.json", proxy))
            .bearer_auth(token(json!({"role": "admin"})))
            .send()
            .await
            .unwrap();
        assert_eq!(admin.status(), StatusCode::OK);
        assert_eq!(admin.headers()["x-seen-role"], "admin");

        let guest = client
            .get(format!("{}/config/app.json", proxy))
            .bearer_auth(token(json!({"role": "guest"})))
            .send()
            .await
            .unwrap();
        assert_eq!(guest.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_hmac_token_is_401() {
        let upstream = spawn_upstream().await;
        let proxy = start_proxy(&upstream).await;

        let forged = format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(br#"{"role":"admin"}"#),
            URL_SAFE_NO_PAD.encode(b"not-a-signature"),
        );
        let res = reqwest::Client::new()
            .get(format!("{}/config/app.json", proxy))
            .bearer_auth(forged)
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_preflight_never_reaches_upstream() {
        let upstream = spawn_upstream().await;
        let proxy = start_proxy(&upstream).await;

        let res = reqwest::Client::new()
            .request(reqwest::Method::OPTIONS, format!("{}/cars/1", proxy))
            .header("access-control-request-headers", "authorization")
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(res.headers()["access-control-allow-origin"], "*");
        assert_eq!(
            res.headers()["access-control-allow-methods"],
            "GET, POST, PUT, HEAD, OPTIONS"
        );
        assert_eq!(res.headers()["access-control-allow-headers"], "authorization");
        assert!(res.text().await.unwrap().is_empty());
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unrouted_requests() {
        let upstream = spawn_upstream().await;
        let proxy = start_proxy(&upstream).await;
        let client = reqwest::Client::new();

        let missing = client.get(format!("{}/boats", proxy)).send().await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let wrong_method = client
            .delete(format!("{}/images", proxy))
            .send()
            .await
            .unwrap();
        assert_eq!(wrong_method.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(wrong_method.headers()["allow"], "GET, OPTIONS");
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_fails_fast_when_a_listener_cannot_bind() {
        let upstream = spawn_upstream().await;
        let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let healthy = config(upstream.addr);
        let mut clashing = config(upstream.addr);
        clashing.connect.from = format!("0.0.0.0:{}", port);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run(vec![healthy, clashing], SecretSource::from_bytes(SECRET)),
        )
        .await
        .expect("run should stop on the bind failure");

        let err = result.unwrap_err();
        assert!(err.contains("Failed to bind"), "{}", err);
    }

    #[tokio::test]
    async fn test_trailing_slash_redirects() {
        let upstream = spawn_upstream().await;
        let proxy = start_proxy(&upstream).await;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        let get = client
            .get(format!("{}/cars?color=red", proxy))
            .send()
            .await
            .unwrap();
        assert_eq!(get.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(get.headers()["location"], "/cars/?color=red");
        assert_eq!(get.headers()["access-control-allow-origin"], "*");

        let post = client.post(format!("{}/cars", proxy)).send().await.unwrap();
        assert_eq!(post.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(post.headers()["location"], "/cars/");

        let images = client.get(format!("{}/images/", proxy)).send().await.unwrap();
        assert_eq!(images.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(images.headers()["location"], "/images");

        let missing = client.get(format!("{}/boats/", proxy)).send().await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_run_serves_every_proxy() {
        let upstream = spawn_upstream().await;
        let ports = [free_port().await, free_port().await];

        let proxies: Vec<ProxyConfig> = ports
            .iter()
            .map(|port| {
                let mut proxy = config(upstream.addr);
                proxy.connect.from = format!("0.0.0.0:{}", port);
                proxy
            })
            .collect();
        let runtime = tokio::spawn(run(proxies, SecretSource::from_bytes(SECRET)));

        let client = reqwest::Client::new();
        for port in ports {
            let url = format!("http://127.0.0.1:{}/cars/1", port);
            let mut attempts = 0;
            let res = loop {
                match client.get(&url).send().await {
                    Ok(res) => break res,
                    Err(e) if attempts < 50 => {
                        attempts += 1;
                        debug!("proxy on {} not up yet: {}", port, e);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Err(e) => panic!("proxy on {} never answered: {}", port, e),
                }
            };
            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(res.text().await.unwrap(), SAMPLE_RESPONSE);
        }

        assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
        assert!(!runtime.is_finished());
        runtime.abort();
    }

    #[tokio::test]
    async fn test_run_without_proxies() {
        assert!(run(vec![], SecretSource::default()).await.is_err());
    }
}
