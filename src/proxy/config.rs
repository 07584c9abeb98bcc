use axum::http::Method;
use serde::Deserialize;

use crate::proxy::router::RoutePattern;
use crate::proxy::upstream::Upstream;

/// One proxy instance: a listener, an upstream and the routes guarding it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProxyConfig {
    pub connect: Connect,

    /// Routes in declaration order. Later entries override earlier ones
    /// registering the same (method, pattern).
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// Listener and upstream addresses
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Connect {
    /// Listen address, `host:port`. Only the port is used for binding.
    #[serde(alias = "From")]
    pub from: String,

    /// Upstream address, `host:port` or an absolute `http(s)://` URL.
    #[serde(alias = "To")]
    pub to: String,

    /// Prepended to every header synthesized from a verified claim.
    #[serde(rename = "header-prefix", alias = "headerPrefix", default)]
    pub header_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Route {
    #[serde(rename = "route")]
    pub pattern: String,

    #[serde(default)]
    pub allow: AccessDefinition,
}

/// Access policy attached to a route.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AccessDefinition {
    /// Methods this route answers. Empty means the route registers nothing.
    #[serde(rename = "method", default)]
    pub methods: Vec<String>,

    /// Requests without a token are let through. A presented token is
    /// still verified and checked against `claims`.
    #[serde(default)]
    pub open: bool,

    /// Any single match is enough; an empty list accepts every valid token.
    #[serde(default)]
    pub claims: Vec<Claim>,

    #[serde(rename = "cachecontrol", alias = "cacheControl", default)]
    pub cache_control: Option<String>,
}

/// A verified claim named `key` must equal one of `value`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Claim {
    #[serde(alias = "Key")]
    pub key: String,

    #[serde(alias = "Value", default)]
    pub value: Vec<String>,
}

impl AccessDefinition {
    /// Parsed, upper-cased method tokens.
    pub fn parsed_methods(&self) -> Result<Vec<Method>, String> {
        self.methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                    .map_err(|_| format!("invalid method token {:?}", m))
            })
            .collect()
    }

    /// `Cache-Control` value to set, if any.
    pub fn cache_control(&self) -> Option<&str> {
        self.cache_control.as_deref().filter(|v| !v.is_empty())
    }
}

impl ProxyConfig {
    /// Port part of `connect.from`.
    pub fn listen_port(&self) -> Result<u16, String> {
        let (_, port) = self
            .connect
            .from
            .rsplit_once(':')
            .ok_or_else(|| format!("listen address {:?} has no port", self.connect.from))?;
        port.parse::<u16>()
            .map_err(|e| format!("listen address {:?}: invalid port: {}", self.connect.from, e))
    }

    pub fn upstream(&self) -> Result<Upstream, String> {
        Upstream::parse(&self.connect.to)
    }

    /// Rejects everything that would otherwise only fail once the listener starts.
    pub fn validate(&self) -> Result<(), String> {
        self.listen_port()?;
        self.upstream()?;

        for route in &self.routes {
            RoutePattern::parse(&route.pattern)
                .map_err(|e| format!("route {:?}: {}", route.pattern, e))?;
            route
                .allow
                .parsed_methods()
                .map_err(|e| format!("route {:?}: {}", route.pattern, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(from: &str, to: &str) -> ProxyConfig {
        ProxyConfig {
            connect: Connect {
                from: from.to_string(),
                to: to.to_string(),
                header_prefix: String::new(),
            },
            routes: vec![],
        }
    }

    #[test]
    fn test_deserialize_documented_shape() {
        let raw = r#"{
            "connect": {"from": "0.0.0.0:5000", "to": "127.0.0.1:8080", "header-prefix": "X-Session-"},
            "routes": [
                {"route": "/cars/*path",
                 "allow": {"method": ["GET", "PUT"], "open": false,
                           "claims": [{"key": "role", "value": ["admin", "support"]}],
                           "cachecontrol": "no-store"}}
            ]
        }"#;
        let cfg: ProxyConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(cfg.connect.header_prefix, "X-Session-");
        assert_eq!(cfg.routes.len(), 1);
        let allow = &cfg.routes[0].allow;
        assert_eq!(allow.methods, vec!["GET", "PUT"]);
        assert!(!allow.open);
        assert_eq!(allow.claims[0].key, "role");
        assert_eq!(allow.claims[0].value, vec!["admin", "support"]);
        assert_eq!(allow.cache_control(), Some("no-store"));
    }

    #[test]
    fn test_optional_fields_default() {
        let raw = r#"{
            "connect": {"from": ":5000", "to": "127.0.0.1:8080"},
            "routes": [{"route": "/images", "allow": {"method": ["GET"]}}]
        }"#;
        let cfg: ProxyConfig = serde_json::from_str(raw).unwrap();
        let allow = &cfg.routes[0].allow;

        assert_eq!(cfg.connect.header_prefix, "");
        assert!(!allow.open);
        assert!(allow.claims.is_empty());
        assert_eq!(allow.cache_control(), None);
    }

    #[test]
    fn test_empty_cache_control_is_unset() {
        let allow = AccessDefinition {
            cache_control: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(allow.cache_control(), None);
    }

    #[test]
    fn test_listen_port() {
        assert_eq!(proxy("0.0.0.0:5000", "a:1").listen_port(), Ok(5000));
        assert_eq!(proxy(":5001", "a:1").listen_port(), Ok(5001));
        assert!(proxy("0.0.0.0", "a:1").listen_port().is_err());
        assert!(proxy("0.0.0.0:http", "a:1").listen_port().is_err());
    }

    #[test]
    fn test_methods_are_normalized() {
        let allow = AccessDefinition {
            methods: vec!["get".into(), " Post ".into()],
            ..Default::default()
        };
        assert_eq!(allow.parsed_methods().unwrap(), vec![Method::GET, Method::POST]);

        let bad = AccessDefinition {
            methods: vec!["GE T".into()],
            ..Default::default()
        };
        assert!(bad.parsed_methods().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let mut cfg = proxy("0.0.0.0:5000", "127.0.0.1:8080");
        cfg.routes.push(Route {
            pattern: "/cars/*path/more".into(),
            allow: AccessDefinition {
                methods: vec!["GET".into()],
                ..Default::default()
            },
        });
        assert!(cfg.validate().is_err());

        cfg.routes[0].pattern = "/cars/*path".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_upstream() {
        assert!(proxy("0.0.0.0:5000", "127.0.0.1").validate().is_err());
        assert!(proxy("0.0.0.0:5000", "127.0.0.1:8080").validate().is_ok());
    }
}
