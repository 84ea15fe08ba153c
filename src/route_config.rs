use std::{
    collections::HashMap,
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::path_slug;

pub const ROUTES_DIR_NAME: &str = "_routes";

/// Per-(domain, method, path) matching overrides. `ignore` is authoritative:
/// its entries subtract from matching. `matched` documents what the first
/// recorded request carried and exists for humans curating the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    pub route: RouteKey,
    #[serde(default)]
    pub matched: MatchedFields,
    #[serde(default)]
    pub ignore: IgnoreFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteKey {
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchedFields {
    #[serde(default)]
    pub query_params: Vec<String>,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub body_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IgnoreFields {
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub body_fields: Vec<String>,
    #[serde(default)]
    pub query_params: Vec<String>,
}

impl RouteConfig {
    /// The config auto-written on first record: empty ignore lists, matched
    /// fields describing what the request carried.
    pub fn default_for_request(
        method: &str,
        path: &str,
        query_param_names: Vec<String>,
        header_names: Vec<String>,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Self {
        Self {
            route: RouteKey {
                method: method.to_ascii_uppercase(),
                path: path.to_owned(),
            },
            matched: MatchedFields {
                query_params: sorted_deduped(query_param_names),
                headers: sorted_deduped(header_names),
                body_fields: top_level_body_fields(body, content_type),
            },
            ignore: IgnoreFields::default(),
        }
    }
}

fn sorted_deduped(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names.dedup();
    names
}

/// Top-level field names of a JSON object or form body, for the advisory
/// `matched.body_fields` list.
fn top_level_body_fields(body: &[u8], content_type: Option<&str>) -> Vec<String> {
    if body.is_empty() {
        return Vec::new();
    }
    let Some(content_type) = content_type else {
        return Vec::new();
    };
    let content_type = content_type.to_ascii_lowercase();

    if content_type.contains("application/json") {
        if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
            return sorted_deduped(map.keys().cloned().collect());
        }
        return Vec::new();
    }

    if content_type.contains("application/x-www-form-urlencoded") {
        let text = String::from_utf8_lossy(body);
        let names = crate::normalize::parse_query_pairs(Some(&text))
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        return sorted_deduped(names);
    }

    Vec::new()
}

#[derive(Debug)]
struct CacheEntry {
    /// `None` while the file is absent.
    mtime: Option<SystemTime>,
    config: Option<Arc<RouteConfig>>,
}

#[derive(Debug, Default)]
struct Inner {
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
    write_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

/// Filesystem-backed store of route configs under
/// `<cassettes_dir>/_routes/<domain>/<METHOD>_<slug>.yaml`, with an
/// mtime-validated read cache.
#[derive(Debug, Clone)]
pub struct RouteConfigStore {
    routes_dir: PathBuf,
    inner: Arc<Inner>,
}

impl RouteConfigStore {
    pub fn new(cassettes_dir: impl AsRef<Path>) -> Self {
        Self {
            routes_dir: cassettes_dir.as_ref().join(ROUTES_DIR_NAME),
            inner: Arc::new(Inner::default()),
        }
    }

    pub fn config_path(&self, domain: &str, method: &str, path: &str) -> PathBuf {
        self.routes_dir.join(domain).join(format!(
            "{}_{}.yaml",
            method.to_ascii_uppercase(),
            path_slug(path)
        ))
    }

    /// Loads the override for a route, reloading from disk when the file's
    /// mtime changed since the cached read. A file that fails to parse is
    /// reported once per change and treated as no override.
    pub async fn load(
        &self,
        domain: &str,
        method: &str,
        path: &str,
    ) -> anyhow::Result<Option<Arc<RouteConfig>>> {
        let config_path = self.config_path(domain, method, path);
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || load_blocking(&inner, &config_path))
            .await
            .context("join route config load task")?
    }

    /// Writes the default config if no file exists yet. Existing files are
    /// never modified; edits are human-curated. Returns whether a file was
    /// written.
    pub async fn ensure_exists(&self, domain: &str, config: RouteConfig) -> anyhow::Result<bool> {
        let config_path = self.config_path(domain, &config.route.method, &config.route.path);
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || ensure_exists_blocking(&inner, &config_path, &config))
            .await
            .context("join route config write task")?
    }
}

fn load_blocking(
    inner: &Inner,
    config_path: &Path,
) -> anyhow::Result<Option<Arc<RouteConfig>>> {
    let mtime = match fs::metadata(config_path) {
        Ok(metadata) => Some(metadata.modified().with_context(|| {
            format!("read mtime of route config {}", config_path.display())
        })?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            return Err(err)
                .with_context(|| format!("stat route config {}", config_path.display()));
        }
    };

    {
        let cache = inner
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = cache.get(config_path)
            && entry.mtime == mtime
        {
            return Ok(entry.config.clone());
        }
    }

    let config = match mtime {
        None => None,
        Some(_) => {
            let yaml = fs::read_to_string(config_path)
                .with_context(|| format!("read route config {}", config_path.display()))?;
            match serde_yaml::from_str::<RouteConfig>(&yaml) {
                Ok(config) => Some(Arc::new(config)),
                Err(err) => {
                    tracing::warn!(
                        file = %config_path.display(),
                        "route config failed to parse, matching without overrides: {err}"
                    );
                    None
                }
            }
        }
    };

    let mut cache = inner
        .cache
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    cache.insert(
        config_path.to_path_buf(),
        CacheEntry {
            mtime,
            config: config.clone(),
        },
    );
    Ok(config)
}

fn ensure_exists_blocking(
    inner: &Inner,
    config_path: &Path,
    config: &RouteConfig,
) -> anyhow::Result<bool> {
    if config_path.exists() {
        return Ok(false);
    }

    let file_lock = {
        let mut locks = inner
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            locks
                .entry(config_path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    };
    let _guard = file_lock
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    // A concurrent recorder may have won the race while we waited.
    if config_path.exists() {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .context("route config path has no parent directory")?;
    fs::create_dir_all(parent)
        .with_context(|| format!("create route config dir {}", parent.display()))?;

    let yaml = serde_yaml::to_string(config).context("serialize route config")?;
    let temp_path = config_path.with_extension("yaml.tmp");
    let write = (|| -> anyhow::Result<()> {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("create temp route config {}", temp_path.display()))?;
        file.write_all(yaml.as_bytes())
            .with_context(|| format!("write temp route config {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("fsync temp route config {}", temp_path.display()))?;
        drop(file);
        fs::rename(&temp_path, config_path).with_context(|| {
            format!(
                "rename route config {} -> {}",
                temp_path.display(),
                config_path.display()
            )
        })
    })();
    if write.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    write?;
    Ok(true)
}
