use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Prompt-shaping parameters bundled under one variant id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantParameters {
    /// Greeting phrase spoken when the call is answered.
    pub greeting: String,
    /// Conversational tone, e.g. "formal" or "casual".
    pub tone: String,
    /// Answer length preference, e.g. "short" or "detailed".
    pub length: String,
    /// How actively the assistant asks clarifying questions.
    pub inquiry_mode: String,
    /// 0..=1; higher values make barge-in trigger on quieter speech.
    pub barge_in_sensitivity: f32,
}

impl Default for VariantParameters {
    fn default() -> Self {
        Self {
            greeting: "Hello, how can I help you today?".to_string(),
            tone: "neutral".to_string(),
            length: "medium".to_string(),
            inquiry_mode: "reactive".to_string(),
            barge_in_sensitivity: 0.5,
        }
    }
}

/// One deployable policy variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyVariant {
    pub id: String,
    pub parameters: VariantParameters,
    /// Marks the never-blacklisted fallback. Exactly one per catalog.
    #[serde(default)]
    pub is_base: bool,
}

/// Errors raised while loading a variant catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("I/O error reading catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("Catalog is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Catalog invalid: {0}")]
    Invalid(String),
}

/// The set of variants the core may deploy, read once at startup.
#[derive(Debug, Clone)]
pub struct PolicyCatalog {
    variants: BTreeMap<String, PolicyVariant>,
    base_id: String,
}

impl PolicyCatalog {
    /// Build a catalog from a variant list, validating the base invariant.
    pub fn new(variants: Vec<PolicyVariant>) -> Result<Self, CatalogError> {
        if variants.is_empty() {
            return Err(CatalogError::Invalid("catalog has no variants".to_string()));
        }
        let bases: Vec<&PolicyVariant> = variants.iter().filter(|v| v.is_base).collect();
        if bases.len() != 1 {
            return Err(CatalogError::Invalid(format!(
                "catalog must contain exactly one base variant, found {}",
                bases.len()
            )));
        }
        let base_id = bases[0].id.clone();

        let mut map = BTreeMap::new();
        for variant in variants {
            if variant.id.is_empty() {
                return Err(CatalogError::Invalid("variant with empty id".to_string()));
            }
            let sensitivity = variant.parameters.barge_in_sensitivity;
            if !(0.0..=1.0).contains(&sensitivity) {
                return Err(CatalogError::Invalid(format!(
                    "variant '{}' barge_in_sensitivity {sensitivity} outside [0, 1]",
                    variant.id
                )));
            }
            if map.insert(variant.id.clone(), variant).is_some() {
                return Err(CatalogError::Invalid("duplicate variant id".to_string()));
            }
        }
        Ok(Self {
            variants: map,
            base_id,
        })
    }

    /// Load the catalog document from disk.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        let variants: Vec<PolicyVariant> = serde_json::from_str(&raw)?;
        let catalog = Self::new(variants)?;
        info!(
            count = catalog.variants.len(),
            base = %catalog.base_id,
            "policy catalog loaded"
        );
        Ok(catalog)
    }

    /// Built-in catalog used when no document is configured.
    pub fn builtin() -> Self {
        let variants = vec![
            PolicyVariant {
                id: "v1a".to_string(),
                parameters: VariantParameters::default(),
                is_base: true,
            },
            PolicyVariant {
                id: "v1b".to_string(),
                parameters: VariantParameters {
                    tone: "casual".to_string(),
                    greeting: "Hi there! What can I do for you?".to_string(),
                    ..Default::default()
                },
                is_base: false,
            },
            PolicyVariant {
                id: "v2a".to_string(),
                parameters: VariantParameters {
                    length: "short".to_string(),
                    inquiry_mode: "proactive".to_string(),
                    barge_in_sensitivity: 0.7,
                    ..Default::default()
                },
                is_base: false,
            },
        ];
        Self::new(variants).expect("builtin catalog is valid")
    }

    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    pub fn get(&self, id: &str) -> Option<&PolicyVariant> {
        self.variants.get(id)
    }

    /// All variant ids in lexicographic order.
    pub fn ids(&self) -> Vec<String> {
        self.variants.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}
