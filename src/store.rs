use std::{
    collections::BTreeMap,
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context as _;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CASSETTE_FORMAT_VERSION: &str = "1";

const FINGERPRINT_PREFIX_LEN: usize = 8;

static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cassette {
    pub meta: CassetteMeta,
    pub request: RecordedRequest,
    pub response: RecordedResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CassetteMeta {
    pub recorded_at: DateTime<Utc>,
    pub target: String,
    pub domain: String,
    pub version: String,
    /// Full 64-hex fingerprint; the filename carries only the first 8 chars.
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, Vec<String>>,
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub body: Option<String>,
    pub body_encoding: BodyEncoding,
    #[serde(default)]
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub body: Option<String>,
    pub body_encoding: BodyEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

/// UTF-8-decodable bodies store as strings; everything else as padded base64.
pub fn encode_body(bytes: &[u8]) -> (Option<String>, BodyEncoding) {
    if bytes.is_empty() {
        return (None, BodyEncoding::Utf8);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (Some(text.to_owned()), BodyEncoding::Utf8),
        Err(_) => (Some(BASE64.encode(bytes)), BodyEncoding::Base64),
    }
}

pub fn decode_body(body: Option<&str>, encoding: BodyEncoding) -> anyhow::Result<Vec<u8>> {
    let Some(body) = body else {
        return Ok(Vec::new());
    };
    match encoding {
        BodyEncoding::Utf8 => Ok(body.as_bytes().to_vec()),
        BodyEncoding::Base64 => BASE64.decode(body).context("decode base64 cassette body"),
    }
}

impl RecordedResponse {
    pub fn body_bytes(&self) -> anyhow::Result<Vec<u8>> {
        decode_body(self.body.as_deref(), self.body_encoding)
    }
}

impl RecordedRequest {
    pub fn body_bytes(&self) -> anyhow::Result<Vec<u8>> {
        decode_body(self.body.as_deref(), self.body_encoding)
    }
}

/// URL path reduced to a filename-safe slug: `/` becomes `_` and anything
/// outside `[A-Za-z0-9_.-]` is stripped.
pub fn path_slug(path: &str) -> String {
    let slug: String = path
        .trim_matches('/')
        .replace('/', "_")
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-'))
        .collect();
    if slug.is_empty() { "root".to_owned() } else { slug }
}

pub fn cassette_filename(method: &str, path: &str, fingerprint: &str) -> String {
    let prefix = &fingerprint[..fingerprint.len().min(FINGERPRINT_PREFIX_LEN)];
    format!("{}_{}_{prefix}.json", method.to_ascii_uppercase(), path_slug(path))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Recorded,
    /// The fingerprint already had a cassette and overwrite was disabled.
    Skipped,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CassetteSummary {
    pub domain: String,
    pub id: String,
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct CassetteStore {
    dir: PathBuf,
}

impl CassetteStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the cassette atomically (temp file in the final directory,
    /// fsync, rename). An existing cassette for the same fingerprint is
    /// replaced when `overwrite` is set, otherwise left untouched.
    pub async fn save(&self, cassette: Cassette, overwrite: bool) -> anyhow::Result<SaveOutcome> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || save_blocking(&dir, &cassette, overwrite))
            .await
            .context("join cassette save task")?
    }

    pub async fn lookup(&self, domain: &str, fingerprint: &str) -> anyhow::Result<Option<Cassette>> {
        let dir = self.dir.clone();
        let domain = domain.to_owned();
        let fingerprint = fingerprint.to_owned();
        tokio::task::spawn_blocking(move || lookup_blocking(&dir, &domain, &fingerprint))
            .await
            .context("join cassette lookup task")?
    }

    pub async fn list(&self, domain: Option<&str>) -> anyhow::Result<Vec<CassetteSummary>> {
        let dir = self.dir.clone();
        let domain = domain.map(ToOwned::to_owned);
        tokio::task::spawn_blocking(move || list_blocking(&dir, domain.as_deref()))
            .await
            .context("join cassette list task")?
    }

    pub async fn delete_all(&self) -> anyhow::Result<usize> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || delete_all_blocking(&dir))
            .await
            .context("join cassette delete task")?
    }

    pub async fn delete_domain(&self, domain: &str) -> anyhow::Result<usize> {
        let dir = self.dir.clone();
        let domain = domain.to_owned();
        tokio::task::spawn_blocking(move || delete_domain_blocking(&dir, &domain))
            .await
            .context("join cassette delete task")?
    }

    pub async fn delete(&self, domain: &str, id: &str) -> anyhow::Result<bool> {
        let dir = self.dir.clone();
        let domain = domain.to_owned();
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || delete_blocking(&dir, &domain, &id))
            .await
            .context("join cassette delete task")?
    }
}

fn save_blocking(dir: &Path, cassette: &Cassette, overwrite: bool) -> anyhow::Result<SaveOutcome> {
    let domain_dir = dir.join(&cassette.meta.domain);
    fs::create_dir_all(&domain_dir)
        .with_context(|| format!("create cassette dir {}", domain_dir.display()))?;

    let filename = cassette_filename(
        &cassette.request.method,
        &cassette.request.path,
        &cassette.meta.fingerprint,
    );
    let final_path = domain_dir.join(&filename);
    if final_path.exists() && !overwrite {
        return Ok(SaveOutcome::Skipped);
    }

    let json = serde_json::to_vec_pretty(cassette).context("serialize cassette")?;

    let temp_name = format!(
        ".{filename}.tmp-{}-{}",
        std::process::id(),
        TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let temp_path = domain_dir.join(temp_name);
    let result = write_and_rename(&temp_path, &final_path, &json);
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result?;
    Ok(SaveOutcome::Recorded)
}

fn write_and_rename(temp_path: &Path, final_path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::File::create(temp_path)
        .with_context(|| format!("create temp cassette {}", temp_path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write temp cassette {}", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("fsync temp cassette {}", temp_path.display()))?;
    drop(file);
    fs::rename(temp_path, final_path).with_context(|| {
        format!(
            "rename cassette {} -> {}",
            temp_path.display(),
            final_path.display()
        )
    })
}

fn lookup_blocking(dir: &Path, domain: &str, fingerprint: &str) -> anyhow::Result<Option<Cassette>> {
    let domain_dir = dir.join(domain);
    if !domain_dir.exists() {
        return Ok(None);
    }

    let prefix = &fingerprint[..fingerprint.len().min(FINGERPRINT_PREFIX_LEN)];
    let suffix = format!("_{prefix}.json");

    let entries = fs::read_dir(&domain_dir)
        .with_context(|| format!("read cassette dir {}", domain_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("iterate cassette dir {}", domain_dir.display()))?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else { continue };
        if name.starts_with('.') || !name.ends_with(&suffix) {
            continue;
        }

        // Truncated prefixes can collide across cassettes; the stored full
        // fingerprint decides.
        match read_cassette(&entry.path()) {
            Ok(cassette) if cassette.meta.fingerprint == fingerprint => {
                return Ok(Some(cassette));
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(file = %entry.path().display(), "skipping unreadable cassette: {err}");
            }
        }
    }
    Ok(None)
}

fn read_cassette(path: &Path) -> anyhow::Result<Cassette> {
    let contents =
        fs::read(path).with_context(|| format!("read cassette {}", path.display()))?;
    serde_json::from_slice(&contents).with_context(|| format!("parse cassette {}", path.display()))
}

fn list_blocking(dir: &Path, domain: Option<&str>) -> anyhow::Result<Vec<CassetteSummary>> {
    let mut out = Vec::new();
    match domain {
        Some(domain) => list_domain_into(dir, domain, &mut out)?,
        None => {
            if !dir.exists() {
                return Ok(out);
            }
            let entries =
                fs::read_dir(dir).with_context(|| format!("read cassettes dir {}", dir.display()))?;
            let mut domains = Vec::new();
            for entry in entries {
                let entry =
                    entry.with_context(|| format!("iterate cassettes dir {}", dir.display()))?;
                if !entry.file_type().map(|ty| ty.is_dir()).unwrap_or(false) {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('_') {
                    // `_routes` holds matching overrides, not cassettes.
                    continue;
                }
                domains.push(name);
            }
            domains.sort();
            for domain in domains {
                list_domain_into(dir, &domain, &mut out)?;
            }
        }
    }
    Ok(out)
}

fn list_domain_into(dir: &Path, domain: &str, out: &mut Vec<CassetteSummary>) -> anyhow::Result<()> {
    let domain_dir = dir.join(domain);
    if !domain_dir.exists() {
        return Ok(());
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    let entries = fs::read_dir(&domain_dir)
        .with_context(|| format!("read cassette dir {}", domain_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("iterate cassette dir {}", domain_dir.display()))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        paths.push(path);
    }
    paths.sort();

    for path in paths {
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        match read_cassette(&path) {
            Ok(cassette) => out.push(CassetteSummary {
                domain: domain.to_owned(),
                id,
                method: cassette.request.method,
                path: cassette.request.path,
            }),
            Err(err) => {
                tracing::debug!(file = %path.display(), "skipping unreadable cassette: {err}");
            }
        }
    }
    Ok(())
}

fn delete_all_blocking(dir: &Path) -> anyhow::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let entries = fs::read_dir(dir).with_context(|| format!("read cassettes dir {}", dir.display()))?;
    let mut deleted = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("iterate cassettes dir {}", dir.display()))?;
        if !entry.file_type().map(|ty| ty.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('_') {
            continue;
        }
        deleted += delete_domain_blocking(dir, &name)?;
    }
    Ok(deleted)
}

fn delete_domain_blocking(dir: &Path, domain: &str) -> anyhow::Result<usize> {
    if !valid_component(domain) {
        return Ok(0);
    }
    let domain_dir = dir.join(domain);
    if !domain_dir.exists() {
        return Ok(0);
    }

    let entries = fs::read_dir(&domain_dir)
        .with_context(|| format!("read cassette dir {}", domain_dir.display()))?;
    let mut deleted = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("iterate cassette dir {}", domain_dir.display()))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        fs::remove_file(&path).with_context(|| format!("delete cassette {}", path.display()))?;
        deleted += 1;
    }
    Ok(deleted)
}

fn delete_blocking(dir: &Path, domain: &str, id: &str) -> anyhow::Result<bool> {
    if !valid_component(domain) || !valid_component(id) {
        return Ok(false);
    }
    let path = dir.join(domain).join(format!("{id}.json"));
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(&path).with_context(|| format!("delete cassette {}", path.display()))?;
    Ok(true)
}

/// Rejects names that could escape the cassette tree.
fn valid_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}
