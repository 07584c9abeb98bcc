//! Route table compiled once per proxy from its declarative route list.
//!
//! The table maps (method, pattern) to the access policy registered for it and
//! is never written after [`DispatchTable::compile`] returns.

use std::fmt;
use std::sync::Arc;

use axum::http::Method;
use thiserror::Error;
use tracing::debug;

use crate::proxy::config::{AccessDefinition, ProxyConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern must start with '/'")]
    NotAbsolute,
    #[error("catch-all must be the last segment")]
    CatchAllNotLast,
    #[error("catch-all must start a segment")]
    CatchAllMidSegment,
    #[error("catch-all needs a name")]
    CatchAllUnnamed,
    #[error("named parameter segments are not supported")]
    NamedParam,
}

#[derive(Debug, Clone)]
enum PatternKind {
    Exact,
    /// `prefix` keeps its trailing slash: `/cars/*path` has prefix `/cars/`.
    CatchAll { prefix: String },
}

/// A literal path or a path ending in one `*name` catch-all segment.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    raw: String,
    kind: PatternKind,
}

impl RoutePattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        if !raw.starts_with('/') {
            return Err(PatternError::NotAbsolute);
        }
        if raw.split('/').any(|segment| segment.starts_with(':')) {
            return Err(PatternError::NamedParam);
        }

        let Some(star) = raw.find('*') else {
            return Ok(Self {
                raw: raw.to_string(),
                kind: PatternKind::Exact,
            });
        };

        if !raw[..star].ends_with('/') {
            return Err(PatternError::CatchAllMidSegment);
        }
        let name = &raw[star + 1..];
        if name.contains('/') || name.contains('*') {
            return Err(PatternError::CatchAllNotLast);
        }
        if name.is_empty() {
            return Err(PatternError::CatchAllUnnamed);
        }

        Ok(Self {
            raw: raw.to_string(),
            kind: PatternKind::CatchAll {
                prefix: raw[..star].to_string(),
            },
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        match &self.kind {
            PatternKind::Exact => path == self.raw,
            PatternKind::CatchAll { prefix } => path.starts_with(prefix.as_str()),
        }
    }

    /// Two patterns with the same key match exactly the same paths.
    fn key(&self) -> (bool, &str) {
        match &self.kind {
            PatternKind::Exact => (false, &self.raw),
            PatternKind::CatchAll { prefix } => (true, prefix),
        }
    }

    fn specificity(&self) -> usize {
        match &self.kind {
            PatternKind::Exact => usize::MAX,
            PatternKind::CatchAll { prefix } => prefix.len(),
        }
    }
}

impl PartialEq for RoutePattern {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RoutePattern {}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// What a dispatch entry does with a request.
#[derive(Debug, Clone)]
pub enum Handler {
    /// Run the authorization pipeline, then forward upstream.
    Authorize(Arc<AccessDefinition>),
    /// Answer the CORS preflight locally with 204.
    Preflight,
}

#[derive(Debug)]
struct PatternEntry {
    pattern: RoutePattern,
    methods: Vec<(Method, Handler)>,
}

impl PatternEntry {
    fn get(&self, method: &Method) -> Option<&Handler> {
        self.methods
            .iter()
            .find(|(m, _)| m == method)
            .map(|(_, h)| h)
    }

    fn insert(&mut self, method: Method, handler: Handler) {
        match self.methods.iter_mut().find(|(m, _)| *m == method) {
            Some(slot) => slot.1 = handler,
            None => self.methods.push((method, handler)),
        }
    }
}

/// Result of looking a request up in the table.
#[derive(Debug)]
pub enum Resolution<'a> {
    Matched {
        pattern: &'a RoutePattern,
        handler: &'a Handler,
    },
    /// The path is routed, but not for this method.
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

#[derive(Debug, Default)]
pub struct DispatchTable {
    entries: Vec<PatternEntry>,
}

impl DispatchTable {
    /// Registers every (method, pattern) of `proxy`, in declaration order.
    ///
    /// A later route registering the same (method, pattern) replaces the
    /// earlier one. Each pattern gets an OPTIONS preflight unless one is
    /// already registered for it.
    pub fn compile(proxy: &ProxyConfig) -> Result<Self, String> {
        let mut table = Self::default();

        for route in &proxy.routes {
            let methods = route
                .allow
                .parsed_methods()
                .map_err(|e| format!("route {:?}: {}", route.pattern, e))?;
            if methods.is_empty() {
                debug!("route {} has no methods, skipped", route.pattern);
                continue;
            }

            let pattern = RoutePattern::parse(&route.pattern)
                .map_err(|e| format!("route {:?}: {}", route.pattern, e))?;
            let access = Arc::new(route.allow.clone());
            let entry = table.entry_mut(pattern);

            for method in methods {
                debug!("LINK: {} {}", method, entry.pattern);
                entry.insert(method, Handler::Authorize(access.clone()));
            }
            if entry.get(&Method::OPTIONS).is_none() {
                debug!("LINK: OPTIONS {} (preflight)", entry.pattern);
                entry.insert(Method::OPTIONS, Handler::Preflight);
            }
        }

        Ok(table)
    }

    fn entry_mut(&mut self, pattern: RoutePattern) -> &mut PatternEntry {
        let idx = match self.entries.iter().position(|e| e.pattern == pattern) {
            Some(idx) => idx,
            None => {
                self.entries.push(PatternEntry {
                    pattern,
                    methods: Vec::new(),
                });
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx]
    }

    /// Exact patterns win over catch-alls; among catch-alls the longest prefix wins.
    pub fn resolve(&self, method: &Method, path: &str) -> Resolution<'_> {
        let best = self
            .entries
            .iter()
            .filter(|e| e.pattern.matches(path))
            .max_by_key(|e| e.pattern.specificity());

        let Some(entry) = best else {
            return Resolution::NotFound;
        };

        match entry.get(method) {
            Some(handler) => Resolution::Matched {
                pattern: &entry.pattern,
                handler,
            },
            None => Resolution::MethodNotAllowed(
                entry.methods.iter().map(|(m, _)| m.clone()).collect(),
            ),
        }
    }

    /// `path` with its trailing slash added or removed, when that variant is
    /// routed for `method`. `/` never redirects.
    pub fn trailing_slash_redirect(&self, method: &Method, path: &str) -> Option<String> {
        let alternate = match path.strip_suffix('/') {
            Some("") => return None,
            Some(trimmed) => trimmed.to_string(),
            None => format!("{}/", path),
        };
        let routed = matches!(self.resolve(method, &alternate), Resolution::Matched { .. });
        routed.then_some(alternate)
    }

    /// Number of (method, pattern) entries, preflights included.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.methods.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
