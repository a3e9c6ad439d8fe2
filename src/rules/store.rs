use crate::error::ProxyError;
use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Parse a rule file body into a list of records, dispatching on the
/// file extension: `.yaml`/`.yml` or `.json`.
pub fn parse_records<T: DeserializeOwned>(raw: &str, path: &Path) -> Result<Vec<T>, ProxyError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(raw)
            .map_err(|e| ProxyError::Internal(format!("{}: {}", path.display(), e))),
        Some("json") => serde_json::from_str(raw)
            .map_err(|e| ProxyError::Internal(format!("{}: {}", path.display(), e))),
        other => Err(ProxyError::Internal(format!(
            "{}: unsupported rule file extension {:?}, use .yaml or .json",
            path.display(),
            other.unwrap_or("")
        ))),
    }
}

struct StoreState<T> {
    snapshot: Arc<T>,
    path: PathBuf,
    loaded: bool,
}

/// File-backed snapshot store shared by the three rule artifacts.
///
/// The file on disk is the source of truth. The first snapshot request
/// loads it; later requests reuse the cached snapshot unless the
/// reload-on-request flag is set or the configured path changed. A
/// reload is a full replace via atomic pointer swap, so readers never see
/// a partially applied file, and a malformed file leaves the previous
/// snapshot in place.
pub struct RuleStore<T> {
    label: &'static str,
    parse: fn(&str, &Path) -> Result<T, ProxyError>,
    state: ArcSwap<StoreState<T>>,
}

impl<T: Default + Send + Sync + 'static> RuleStore<T> {
    pub fn new(label: &'static str, parse: fn(&str, &Path) -> Result<T, ProxyError>) -> Self {
        Self {
            label,
            parse,
            state: ArcSwap::new(Arc::new(StoreState {
                snapshot: Arc::new(T::default()),
                path: PathBuf::new(),
                loaded: false,
            })),
        }
    }

    pub async fn snapshot(&self, path: &Path, reload: bool) -> Arc<T> {
        let current = self.state.load_full();
        if current.loaded && !reload && current.path == path {
            return current.snapshot.clone();
        }

        match self.read_and_parse(path).await {
            Ok(next) => {
                let next = Arc::new(next);
                self.state.store(Arc::new(StoreState {
                    snapshot: next.clone(),
                    path: path.to_path_buf(),
                    loaded: true,
                }));
                metrics::counter!(
                    "proxy_rule_reloads_total",
                    "artifact" => self.label,
                    "result" => "success",
                )
                .increment(1);
                next
            }
            Err(e) => {
                tracing::warn!(
                    "rules: {} load failed, keeping previous snapshot, path={}, error={}",
                    self.label,
                    path.display(),
                    e
                );
                metrics::counter!(
                    "proxy_rule_reloads_total",
                    "artifact" => self.label,
                    "result" => "error",
                )
                .increment(1);
                current.snapshot.clone()
            }
        }
    }

    async fn read_and_parse(&self, path: &Path) -> Result<T, ProxyError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ProxyError::Internal(format!("{}: {}", path.display(), e)))?;
        (self.parse)(&raw, path)
    }
}
