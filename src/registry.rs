//! Model registry: the JSON document listing installed local models.
//!
//! The local controller resolves model IDs to filesystem paths through
//! the registry. Entries whose files are missing on disk produce a
//! startup warning; attempting to use an unknown ID fails with a
//! model-not-found error at call time.

use crate::error::{AssistantError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::warn;

/// What a registered model is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Text generation.
    Llm,
    /// Text embeddings.
    Embedding,
    /// Speech-to-text.
    Whisper,
    /// Text-to-speech.
    Tts,
    /// Voice activity detection.
    Vad,
}

/// On-disk format of a registered model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Gguf,
    Ggml,
    Pt,
    Onnx,
    /// Not a file: resolved through a remote API.
    Api,
}

/// One installed model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Stable identifier referenced by config.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Model purpose.
    #[serde(rename = "type")]
    pub kind: ModelKind,
    /// Path to the model file, relative to the model root when not absolute.
    pub path: PathBuf,
    /// File format.
    pub format: ModelFormat,
    /// File size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Quantization level (e.g. "q4_0"), when applicable.
    #[serde(default)]
    pub quantization: Option<String>,
    /// Content hash for integrity checks.
    #[serde(default)]
    pub hash: Option<String>,
    /// Free-form parameters passed to the runtime.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// The registry document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

/// Installed-model lookup for the local controller.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<ModelEntry>,
    /// Root prepended to relative model paths.
    model_root: Option<PathBuf>,
}

impl ModelRegistry {
    /// Load the registry from a JSON document.
    ///
    /// The model root comes from the [`crate::config::MODEL_DIR_ENV`]
    /// environment variable when set, otherwise the registry file's
    /// parent directory. Entries with missing files are kept (they may
    /// appear later) but warned about.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let document: RegistryDocument = serde_json::from_str(&raw)?;
        let model_root = std::env::var(crate::config::MODEL_DIR_ENV)
            .ok()
            .map(PathBuf::from)
            .or_else(|| path.parent().map(Path::to_path_buf));

        let registry = Self {
            models: document.models,
            model_root,
        };
        for entry in &registry.models {
            if entry.format != ModelFormat::Api {
                let resolved = registry.full_path(entry);
                if !resolved.exists() {
                    warn!(
                        id = %entry.id,
                        path = %resolved.display(),
                        "registered model file not found"
                    );
                }
            }
        }
        Ok(registry)
    }

    /// An empty registry (no local models installed).
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry with a single LLM entry. Used when no registry file
    /// is configured (the backend resolves the model itself) and by
    /// test setups.
    pub fn single(id: &str) -> Self {
        Self {
            models: vec![ModelEntry {
                id: id.to_owned(),
                name: id.to_owned(),
                kind: ModelKind::Llm,
                path: PathBuf::from(format!("{id}.gguf")),
                format: ModelFormat::Gguf,
                size: 0,
                quantization: None,
                hash: None,
                parameters: Map::new(),
            }],
            model_root: None,
        }
    }

    /// Look up a model entry by ID.
    pub fn get(&self, id: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Resolve a model ID to its filesystem path.
    pub fn resolve(&self, id: &str) -> Result<PathBuf> {
        let entry = self
            .get(id)
            .ok_or_else(|| AssistantError::LocalModel(format!("model '{id}' not in registry")))?;
        Ok(self.full_path(entry))
    }

    /// All registered models of the given kind.
    pub fn of_kind(&self, kind: ModelKind) -> impl Iterator<Item = &ModelEntry> {
        self.models.iter().filter(move |m| m.kind == kind)
    }

    fn full_path(&self, entry: &ModelEntry) -> PathBuf {
        if entry.path.is_absolute() {
            entry.path.clone()
        } else {
            match &self.model_root {
                Some(root) => root.join(&entry.path),
                None => entry.path.clone(),
            }
        }
    }
}
