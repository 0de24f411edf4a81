//! Manifest store: loads multi-document YAML manifests into a [`ResourceSet`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::resource::{Manifest, ObjectMeta, Resource, ResourceId, ResourceSet, DEFAULT_NAMESPACE};

/// Kind of a document that wraps other documents in `items`.
const LIST_KIND: &str = "List";

/// A manifest file that was left out of a load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadFailure {
    /// File path relative to the manifest root.
    pub source: String,
    /// Why the file was excluded.
    pub error: String,
}

/// Result of a tolerant load.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Resources from every file that loaded cleanly.
    pub resources: ResourceSet,
    /// Files whose resources made it into `resources`, relative to the root.
    pub files: Vec<PathBuf>,
    /// Files that were excluded.
    pub failures: Vec<LoadFailure>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Loads manifests below a root directory.
pub struct ManifestStore {
    root: PathBuf,
    namespace: String,
}

impl ManifestStore {
    /// Creates a store for `root`; documents without a namespace get `namespace`.
    pub fn new(root: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            namespace: namespace.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loads every manifest below the root.
    ///
    /// Fails on the first malformed file or on an id defined in two files;
    /// no partial set is returned.
    pub fn load_all(&self) -> Result<(ResourceSet, Vec<PathBuf>)> {
        let files = self.manifest_files()?;
        let report = self.collect(&files, true)?;
        Ok((report.resources, report.files))
    }

    /// Loads the given files (relative to the root). Missing files are skipped.
    pub fn load_subset(&self, files: &[PathBuf]) -> Result<ResourceSet> {
        let files = self.existing_manifests(files);
        Ok(self.collect(&files, true)?.resources)
    }

    /// Like [`load_all`](Self::load_all), but a bad file only excludes its own
    /// resources.
    pub fn load_all_tolerant(&self) -> Result<LoadReport> {
        let files = self.manifest_files()?;
        self.collect(&files, false)
    }

    /// Like [`load_subset`](Self::load_subset), but a bad file only excludes
    /// its own resources.
    pub fn load_subset_tolerant(&self, files: &[PathBuf]) -> Result<LoadReport> {
        let files = self.existing_manifests(files);
        self.collect(&files, false)
    }

    /// Parses a single file relative to the root.
    pub fn load_file(&self, relative: &Path) -> Result<ResourceSet> {
        let path = self.root.join(relative);
        let content = fs::read(&path).map_err(|e| SyncError::ReadFile {
            path: path.clone(),
            source: e,
        })?;

        parse_multidoc(&self.namespace, &content, &source_name(relative))
    }

    fn collect(&self, files: &[PathBuf], strict: bool) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        for relative in files {
            let source = source_name(relative);

            let outcome = self.load_file(relative).and_then(|set| {
                match set.first_overlap(&report.resources) {
                    Some(id) => {
                        let first = report
                            .resources
                            .get(id)
                            .map(|r| r.source().to_string())
                            .unwrap_or_default();
                        Err(SyncError::DuplicateDefinition {
                            id: id.clone(),
                            first,
                            second: source.clone(),
                        })
                    }
                    None => Ok(set),
                }
            });

            match outcome {
                Ok(set) => {
                    report.resources.merge(set);
                    report.files.push(relative.clone());
                }
                Err(e) if strict => return Err(e),
                Err(e) => {
                    log::warn!("Excluding manifest {}: {}", source, e);
                    report.failures.push(LoadFailure {
                        source,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Lists manifest files below the root, relative and sorted.
    fn manifest_files(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Err(SyncError::ManifestDirNotFound(self.root.clone()));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| SyncError::ReadDirectory {
                path: e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone()),
                source: e.into(),
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let relative = match entry.path().strip_prefix(&self.root) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => continue,
            };

            if is_manifest_path(&relative) {
                files.push(relative);
            }
        }

        Ok(files)
    }

    fn existing_manifests(&self, files: &[PathBuf]) -> Vec<PathBuf> {
        let mut existing: Vec<PathBuf> = files
            .iter()
            .filter(|f| is_manifest_path(f) && self.root.join(f).is_file())
            .cloned()
            .collect();
        existing.sort();
        existing.dedup();
        existing
    }
}

/// Returns true for `.yaml`/`.yml` files outside hidden directories.
pub fn is_manifest_path(relative: &Path) -> bool {
    let hidden = relative.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
    });
    if hidden {
        return false;
    }

    let ext = relative.extension().and_then(|e| e.to_str()).unwrap_or("");
    ext == "yaml" || ext == "yml"
}

/// Source name recorded for a file: its root-relative path with `/` separators.
pub fn source_name(relative: &Path) -> String {
    relative.to_string_lossy().replace('\\', "/")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentHeader {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    metadata: Option<ObjectMeta>,
    #[serde(default)]
    items: Vec<serde_yaml::Value>,
}

/// Parses multi-document manifest text into a resource set.
///
/// Documents are separated by lines beginning with `---`. Empty documents are
/// skipped, `List` documents are expanded into their items and documents
/// without a namespace get `namespace` (or `default` when that is empty).
pub fn parse_multidoc(namespace: &str, bytes: &[u8], source: &str) -> Result<ResourceSet> {
    let text = std::str::from_utf8(bytes).map_err(|e| SyncError::ParseManifest {
        source_name: source.to_string(),
        message: e.to_string(),
    })?;

    let namespace = if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    };

    let mut set = ResourceSet::new();
    for chunk in split_documents(text) {
        let value: serde_yaml::Value =
            serde_yaml::from_str(&chunk).map_err(|e| SyncError::ParseManifest {
                source_name: source.to_string(),
                message: e.to_string(),
            })?;

        if value.is_null() {
            continue;
        }

        decode_document(namespace, value, chunk.into_bytes(), source, &mut set)?;
    }

    Ok(set)
}

fn split_documents(text: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line.starts_with("---") {
            documents.push(std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    documents.push(current);

    documents
        .into_iter()
        .filter(|doc| !doc.trim().is_empty())
        .collect()
}

fn decode_document(
    namespace: &str,
    value: serde_yaml::Value,
    bytes: Vec<u8>,
    source: &str,
    set: &mut ResourceSet,
) -> Result<()> {
    let parse_error = |message: String| SyncError::ParseManifest {
        source_name: source.to_string(),
        message,
    };

    if !value.is_mapping() {
        return Err(parse_error("document is not a mapping".to_string()));
    }

    let header: DocumentHeader =
        serde_yaml::from_value(value).map_err(|e| parse_error(e.to_string()))?;

    let kind = match header.kind {
        Some(kind) if !kind.is_empty() => kind,
        _ => return Err(parse_error("missing kind".to_string())),
    };

    if kind == LIST_KIND {
        for item in header.items {
            let item_bytes =
                serde_yaml::to_string(&item).map_err(|e| parse_error(e.to_string()))?;
            decode_document(namespace, item, item_bytes.into_bytes(), source, set)?;
        }
        return Ok(());
    }

    let metadata = header.metadata.unwrap_or_default();
    if metadata.name.is_empty() {
        return Err(parse_error(format!("{} has no metadata.name", kind)));
    }

    let resource_namespace = metadata
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(namespace);
    let id = ResourceId::new(resource_namespace, kind, metadata.name.clone());

    if set.contains(&id) {
        return Err(SyncError::DuplicateDefinition {
            id,
            first: source.to_string(),
            second: source.to_string(),
        });
    }

    set.add(Manifest::new(id, source, bytes, metadata));
    Ok(())
}
