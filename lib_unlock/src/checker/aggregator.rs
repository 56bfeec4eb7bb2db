//! # Configuration Aggregator
//!
//! Downloads the fleet documents, concatenates their endpoint lists in input
//! order and renders the single control document the routing engine is
//! started with.
//!
//! A document that cannot be fetched or parsed is logged and skipped; the run
//! only fails when no document at all is usable. Base settings (route groups,
//! rules, DNS, providers) are copied verbatim from the first usable document.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use serde_yml::{Mapping, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::error::{AggregateError, FetchError, PersistenceError};
use super::model::Endpoint;
use super::store::write_atomic;
use crate::configs::app_config::EngineConfig;

/// Selector added when the base document defines no route groups.
pub const ALL_ENDPOINTS_GROUP: &str = "All Endpoints";

/// Rule used when the base document defines none.
const FALLBACK_RULE: &str = "MATCH,GLOBAL";

/// Top-level sections copied verbatim from the first usable document.
const BASE_KEYS: [&str; 5] = [
    "proxy-groups",
    "rules",
    "dns",
    "rule-providers",
    "proxy-providers",
];

/// One parsed fleet document.
#[derive(Debug, Clone)]
pub struct FleetDocument {
    pub source: String,
    pub body: Mapping,
}

impl FleetDocument {
    /// Parses `text` fetched from `source`.
    pub fn parse(source: &str, text: &str) -> Result<Self, FetchError> {
        let value: Value = serde_yml::from_str(text).map_err(|e| FetchError::Yaml {
            url: source.to_string(),
            source: e,
        })?;
        match value {
            Value::Mapping(body) => Ok(Self {
                source: source.to_string(),
                body,
            }),
            _ => Err(FetchError::NotAMapping {
                url: source.to_string(),
            }),
        }
    }

    /// Well-formed endpoints of the `proxies` list. Malformed or nameless
    /// entries are dropped with a warning.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let Some(Value::Sequence(items)) = self.body.get("proxies") else {
            return Vec::new();
        };
        items
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| match serde_yml::from_value::<Endpoint>(item.clone()) {
                Ok(endpoint) if !endpoint.name.trim().is_empty() => Some(endpoint),
                Ok(_) => {
                    warn!("{}: proxy #{} has an empty name, dropped", self.source, idx);
                    None
                }
                Err(e) => {
                    warn!("{}: proxy #{} is malformed, dropped: {}", self.source, idx, e);
                    None
                }
            })
            .collect()
    }
}

/// # Aggregated Config
///
/// The merged endpoint list plus the base sections of the first document.
#[derive(Debug, Clone, Default)]
pub struct AggregatedConfig {
    endpoints: Vec<Endpoint>,
    base: Mapping,
    pub sources_ok: usize,
    pub sources_failed: usize,
}

impl AggregatedConfig {
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn into_endpoints(self) -> Vec<Endpoint> {
        self.endpoints
    }

    /// Base sections as copied from the first document.
    pub fn base(&self) -> &Mapping {
        &self.base
    }

    /// Builds the engine control document.
    pub fn render(&self, engine: &EngineConfig) -> Result<RenderedConfig, serde_yml::Error> {
        let mut base = self.base.clone();
        if !base.contains_key("proxy-groups") {
            let group = ProxyGroup {
                name: ALL_ENDPOINTS_GROUP,
                kind: "select",
                proxies: self.endpoints.iter().map(|e| e.name.as_str()).collect(),
            };
            base.insert(
                Value::String("proxy-groups".to_string()),
                serde_yml::to_value(vec![group])?,
            );
        }
        if !base.contains_key("rules") {
            base.insert(
                Value::String("rules".to_string()),
                Value::Sequence(vec![Value::String(FALLBACK_RULE.to_string())]),
            );
        }

        let document = RenderedDocument {
            mixed_port: engine.proxy.port,
            allow_lan: false,
            mode: &engine.mode,
            log_level: "info",
            external_controller: external_controller(&engine.api_url),
            secret: engine.secret(),
            authentication: engine
                .proxy
                .auth
                .iter()
                .map(|a| format!("{}:{}", a.user, a.pass))
                .collect(),
            proxies: &self.endpoints,
            base: &base,
        };

        let yaml = serde_yml::to_string(&document)?;
        let digest = hex::encode(Sha256::digest(yaml.as_bytes()));
        Ok(RenderedConfig {
            yaml,
            digest,
            endpoint_count: self.endpoints.len(),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct RenderedDocument<'a> {
    mixed_port: u16,
    allow_lan: bool,
    mode: &'a str,
    log_level: &'static str,
    external_controller: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    authentication: Vec<String>,
    proxies: &'a [Endpoint],
    #[serde(flatten)]
    base: &'a Mapping,
}

#[derive(Serialize)]
struct ProxyGroup<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    proxies: Vec<&'a str>,
}

/// The rendered control document and its SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub yaml: String,
    pub digest: String,
    pub endpoint_count: usize,
}

impl RenderedConfig {
    /// Writes the document to `path` (temp file, then rename).
    pub fn write_to(&self, path: &Path) -> Result<(), PersistenceError> {
        write_atomic(path, self.yaml.as_bytes())?;
        info!(
            "Merged configuration with {} endpoints written to {}",
            self.endpoint_count,
            path.display()
        );
        Ok(())
    }
}

/// `host:port` of the control-plane URL, as the engine expects it.
fn external_controller(api_url: &str) -> String {
    url::Url::parse(api_url)
        .ok()
        .and_then(|u| {
            let host = u.host_str()?.to_string();
            let port = u.port_or_known_default()?;
            Some(format!("{}:{}", host, port))
        })
        .unwrap_or_else(|| "127.0.0.1:9090".to_string())
}

/// Merges parsed documents in order.
///
/// Endpoint names are unique in the result: the first occurrence wins and
/// later ones are dropped with a warning.
pub fn merge_documents(documents: &[FleetDocument]) -> AggregatedConfig {
    let mut merged = AggregatedConfig {
        sources_ok: documents.len(),
        ..Default::default()
    };

    if let Some(first) = documents.first() {
        for key in BASE_KEYS {
            if let Some(value) = first.body.get(key) {
                merged
                    .base
                    .insert(Value::String(key.to_string()), value.clone());
            }
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    for document in documents {
        for endpoint in document.endpoints() {
            if seen.contains(&endpoint.name) {
                warn!(
                    "{}: duplicate endpoint name '{}' dropped, first occurrence kept",
                    document.source, endpoint.name
                );
                continue;
            }
            seen.insert(endpoint.name.clone());
            merged.endpoints.push(endpoint);
        }
    }
    merged
}

/// # Config Aggregator
///
/// Fetches fleet documents over plain HTTP(S). No retries: a document that
/// fails is skipped for this run.
#[derive(Debug, Clone)]
pub struct ConfigAggregator {
    client: reqwest::Client,
    timeout: Duration,
}

impl ConfigAggregator {
    pub fn new(fetch_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: fetch_timeout,
        }
    }

    /// Downloads and parses one document.
    pub async fn fetch_document(&self, url: &str) -> Result<FleetDocument, FetchError> {
        let http_err = |e: reqwest::Error| FetchError::Http {
            url: url.to_string(),
            source: e,
        };
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(http_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let text = response.text().await.map_err(http_err)?;
        FleetDocument::parse(url, &text)
    }

    /// Fetches every URL in order and merges the usable documents.
    ///
    /// # Errors
    /// [`AggregateError::NoConfigAvailable`] when no document was usable.
    pub async fn aggregate(&self, urls: &[String]) -> Result<AggregatedConfig, AggregateError> {
        let mut documents = Vec::with_capacity(urls.len());
        for (idx, url) in urls.iter().enumerate() {
            info!("Fetching fleet document {}/{}: {}", idx + 1, urls.len(), url);
            match self.fetch_document(url).await {
                Ok(document) => documents.push(document),
                Err(e) => warn!("Skipping fleet document: {}", e),
            }
        }

        if documents.is_empty() {
            return Err(AggregateError::NoConfigAvailable {
                attempted: urls.len(),
            });
        }

        let mut merged = merge_documents(&documents);
        merged.sources_failed = urls.len() - documents.len();
        info!(
            "Aggregated {} endpoints from {} document(s), {} skipped",
            merged.endpoints.len(),
            merged.sources_ok,
            merged.sources_failed
        );
        Ok(merged)
    }
}
