//! Persistence collaborator for merged lists, per-source caches and metadata

use super::format::ListKind;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Outcome of the last refresh of a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    /// Never refreshed
    #[default]
    Pending,
    /// Downloaded and parsed
    Success,
    /// Failed with nothing cached
    Error,
    /// Failed, serving the last good copy
    Cache,
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Success => "success",
            SourceStatus::Error => "error",
            SourceStatus::Cache => "cache",
        };
        f.write_str(s)
    }
}

/// Per-source bookkeeping, persisted as JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMeta {
    /// Time of the last successful download
    pub last_update: Option<DateTime<Utc>>,
    /// Entries currently contributed by the source
    pub domain_count: usize,
    /// Last refresh outcome
    pub status: SourceStatus,
    /// Last failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Storage for list state that survives restarts
pub trait ListPersistence: Send + Sync {
    /// Merged domain list last published
    fn load_list(&self, kind: ListKind) -> Result<Vec<String>>;
    /// Store the merged domain list
    fn save_list(&self, kind: ListKind, entries: &[String]) -> Result<()>;
    /// Merged malicious URL list last published
    fn load_urls(&self) -> Result<Vec<String>>;
    /// Store the merged malicious URL list
    fn save_urls(&self, urls: &[String]) -> Result<()>;
    /// Last good items of one source, `None` if never cached
    fn load_source(&self, id: &str) -> Result<Option<Vec<String>>>;
    /// Store the last good items of one source
    fn save_source(&self, id: &str, items: &[String]) -> Result<()>;
    /// User-managed entries
    fn load_custom(&self, kind: ListKind) -> Result<Vec<String>>;
    /// Store user-managed entries
    fn save_custom(&self, kind: ListKind, entries: &[String]) -> Result<()>;
    /// Per-source metadata
    fn load_metadata(&self) -> Result<HashMap<String, SourceMeta>>;
    /// Store per-source metadata
    fn save_metadata(&self, meta: &HashMap<String, SourceMeta>) -> Result<()>;
}

/// Newline-delimited text files plus `metadata.json` under one directory
///
/// ```text
/// <root>/blocklist.txt
/// <root>/whitelist.txt
/// <root>/malicious_urls.txt
/// <root>/custom/{blocklist,whitelist}.txt
/// <root>/sources/<id>.txt
/// <root>/metadata.json
/// ```
#[derive(Debug, Clone)]
pub struct FilePersistence {
    root: PathBuf,
}

impl FilePersistence {
    /// Use `root` as the data directory, creating it if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("custom"))
            .and_then(|()| fs::create_dir_all(root.join("sources")))
            .map_err(|e| Error::persistence(root.display().to_string(), e.to_string()))?;
        Ok(Self { root })
    }

    /// The data directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn list_path(&self, kind: ListKind) -> PathBuf {
        self.root.join(format!("{}.txt", kind.name()))
    }

    fn custom_path(&self, kind: ListKind) -> PathBuf {
        self.root.join("custom").join(format!("{}.txt", kind.name()))
    }

    fn source_path(&self, id: &str) -> PathBuf {
        let safe: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join("sources").join(format!("{safe}.txt"))
    }
}

fn read_lines(path: &Path) -> Result<Option<Vec<String>>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from)
                .collect(),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::persistence(path.display().to_string(), e.to_string())),
    }
}

/// Write through a temp file so readers never see a partial list
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)
        .and_then(|()| fs::rename(&tmp, path))
        .map_err(|e| Error::persistence(path.display().to_string(), e.to_string()))
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    write_atomic(path, &content)
}

impl ListPersistence for FilePersistence {
    fn load_list(&self, kind: ListKind) -> Result<Vec<String>> {
        Ok(read_lines(&self.list_path(kind))?.unwrap_or_default())
    }

    fn save_list(&self, kind: ListKind, entries: &[String]) -> Result<()> {
        write_lines(&self.list_path(kind), entries)
    }

    fn load_urls(&self) -> Result<Vec<String>> {
        Ok(read_lines(&self.root.join("malicious_urls.txt"))?.unwrap_or_default())
    }

    fn save_urls(&self, urls: &[String]) -> Result<()> {
        write_lines(&self.root.join("malicious_urls.txt"), urls)
    }

    fn load_source(&self, id: &str) -> Result<Option<Vec<String>>> {
        read_lines(&self.source_path(id))
    }

    fn save_source(&self, id: &str, items: &[String]) -> Result<()> {
        write_lines(&self.source_path(id), items)
    }

    fn load_custom(&self, kind: ListKind) -> Result<Vec<String>> {
        Ok(read_lines(&self.custom_path(kind))?.unwrap_or_default())
    }

    fn save_custom(&self, kind: ListKind, entries: &[String]) -> Result<()> {
        write_lines(&self.custom_path(kind), entries)
    }

    fn load_metadata(&self) -> Result<HashMap<String, SourceMeta>> {
        let path = self.root.join("metadata.json");
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Error::persistence(path.display().to_string(), e.to_string())),
        }
    }

    fn save_metadata(&self, meta: &HashMap<String, SourceMeta>) -> Result<()> {
        let json = serde_json::to_string_pretty(meta)?;
        write_atomic(&self.root.join("metadata.json"), &json)
    }
}

/// Volatile persistence, for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    lists: Mutex<HashMap<ListKind, Vec<String>>>,
    urls: Mutex<Vec<String>>,
    sources: Mutex<HashMap<String, Vec<String>>>,
    custom: Mutex<HashMap<ListKind, Vec<String>>>,
    meta: Mutex<HashMap<String, SourceMeta>>,
}

impl MemoryPersistence {
    /// Creates empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl ListPersistence for MemoryPersistence {
    fn load_list(&self, kind: ListKind) -> Result<Vec<String>> {
        Ok(self.lists.lock().get(&kind).cloned().unwrap_or_default())
    }

    fn save_list(&self, kind: ListKind, entries: &[String]) -> Result<()> {
        self.lists.lock().insert(kind, entries.to_vec());
        Ok(())
    }

    fn load_urls(&self) -> Result<Vec<String>> {
        Ok(self.urls.lock().clone())
    }

    fn save_urls(&self, urls: &[String]) -> Result<()> {
        *self.urls.lock() = urls.to_vec();
        Ok(())
    }

    fn load_source(&self, id: &str) -> Result<Option<Vec<String>>> {
        Ok(self.sources.lock().get(id).cloned())
    }

    fn save_source(&self, id: &str, items: &[String]) -> Result<()> {
        self.sources.lock().insert(id.to_string(), items.to_vec());
        Ok(())
    }

    fn load_custom(&self, kind: ListKind) -> Result<Vec<String>> {
        Ok(self.custom.lock().get(&kind).cloned().unwrap_or_default())
    }

    fn save_custom(&self, kind: ListKind, entries: &[String]) -> Result<()> {
        self.custom.lock().insert(kind, entries.to_vec());
        Ok(())
    }

    fn load_metadata(&self) -> Result<HashMap<String, SourceMeta>> {
        Ok(self.meta.lock().clone())
    }

    fn save_metadata(&self, meta: &HashMap<String, SourceMeta>) -> Result<()> {
        *self.meta.lock() = meta.clone();
        Ok(())
    }
}
