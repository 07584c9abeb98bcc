use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::proxy::ProxyConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config document #{index}: {source}")]
    Parse {
        index: usize,
        source: serde_json::Error,
    },

    #[error("Invalid proxy #{index} (from {from}): {reason}")]
    Invalid {
        index: usize,
        from: String,
        reason: String,
    },

    #[error("no proxies configured")]
    Empty,
}

/// Read every config file in order and merge them into one proxy list.
pub fn load_config_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<ProxyConfig>, ConfigError> {
    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        tracing::debug!("load config: {}", path.display());
        let content = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        documents.push(content);
    }
    parse_config_documents(&documents)
}

/// Parse and validate config documents.
///
/// A document is a single proxy object, an array of them, or an object with
/// a `proxies` array. Proxies keep document order.
pub fn parse_config_documents<D: AsRef<[u8]>>(
    documents: &[D],
) -> Result<Vec<ProxyConfig>, ConfigError> {
    let mut proxies = Vec::new();

    for (index, document) in documents.iter().enumerate() {
        let parse_err = |source| ConfigError::Parse { index, source };
        let value: Value = serde_json::from_slice(document.as_ref()).map_err(parse_err)?;

        match value {
            Value::Array(_) => {
                proxies.extend(serde_json::from_value::<Vec<ProxyConfig>>(value).map_err(parse_err)?)
            }
            Value::Object(ref map) if map.contains_key("proxies") && !map.contains_key("connect") => {
                let list = map.get("proxies").cloned().unwrap_or(Value::Null);
                proxies.extend(serde_json::from_value::<Vec<ProxyConfig>>(list).map_err(parse_err)?)
            }
            other => proxies.push(serde_json::from_value::<ProxyConfig>(other).map_err(parse_err)?),
        }
    }

    if proxies.is_empty() {
        return Err(ConfigError::Empty);
    }

    for (index, proxy) in proxies.iter().enumerate() {
        proxy.validate().map_err(|reason| ConfigError::Invalid {
            index,
            from: proxy.connect.from.clone(),
            reason,
        })?;
    }

    Ok(proxies)
}
