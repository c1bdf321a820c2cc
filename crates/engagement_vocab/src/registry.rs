use crate::error::VocabError;
use crate::scheme::CodeScheme;
use engagement_ids::CodeSchemeId;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Read-only set of code schemes shared by every pipeline stage.
#[derive(Debug, Clone, Default)]
pub struct VocabularyRegistry {
    schemes: BTreeMap<CodeSchemeId, Arc<CodeScheme>>,
    sources: BTreeMap<CodeSchemeId, String>,
}

impl VocabularyRegistry {
    /// Build from in-memory schemes.
    pub fn from_schemes(schemes: impl IntoIterator<Item = CodeScheme>) -> Result<Self, VocabError> {
        let mut registry = Self::default();
        for (idx, scheme) in schemes.into_iter().enumerate() {
            registry.insert(scheme, format!("<memory #{}>", idx))?;
        }
        Ok(registry)
    }

    /// Load every `*.json` file below `dir`, recursively.
    pub fn load_dir(dir: &Path) -> Result<Self, VocabError> {
        if !dir.is_dir() {
            return Err(VocabError::MissingDirectory(dir.to_path_buf()));
        }

        let mut registry = Self::default();
        let mut paths = Vec::new();
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry.map_err(|e| VocabError::Io {
                path: e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf()),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk error")),
            })?;
            let is_json = entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false);
            if entry.file_type().is_file() && is_json {
                paths.push(entry.into_path());
            }
        }
        // Deterministic duplicate reporting.
        paths.sort();

        for path in paths {
            let text = std::fs::read_to_string(&path).map_err(|source| VocabError::Io {
                path: path.clone(),
                source,
            })?;
            let scheme: CodeScheme =
                serde_json::from_str(&text).map_err(|source| VocabError::Parse {
                    path: path.clone(),
                    source,
                })?;
            debug!(scheme = %scheme.scheme_id(), path = %path.display(), "Loaded code scheme");
            registry.insert(scheme, path.display().to_string())?;
        }

        info!(dir = %dir.display(), schemes = registry.len(), "Vocabulary registry loaded");
        Ok(registry)
    }

    fn insert(&mut self, scheme: CodeScheme, source: String) -> Result<(), VocabError> {
        let id = scheme.scheme_id().clone();
        if let Some(first) = self.sources.get(&id) {
            return Err(VocabError::DuplicateScheme {
                scheme_id: id,
                first: first.clone(),
                second: source,
            });
        }
        self.sources.insert(id.clone(), source);
        self.schemes.insert(id, Arc::new(scheme));
        Ok(())
    }

    pub fn get(&self, scheme_id: &CodeSchemeId) -> Option<&Arc<CodeScheme>> {
        self.schemes.get(scheme_id)
    }

    pub fn contains(&self, scheme_id: &CodeSchemeId) -> bool {
        self.schemes.contains_key(scheme_id)
    }

    pub fn len(&self) -> usize {
        self.schemes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CodeScheme>> {
        self.schemes.values()
    }
}
