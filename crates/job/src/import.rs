//! Typed payload and result of `import` jobs.
//!
//! The job entity stores both as opaque bytes; these helpers are the JSON
//! encoding the import runner and its callers agree on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid job blob: {0}")]
    Json(#[from] serde_json::Error),
}

/// Source file format of an import.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportFormat {
    Json,
    GeoJson,
    Csv,
}

/// How imported rows are reconciled with existing items.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStrategy {
    /// Only create new items
    Insert,
    /// Only update items that already exist
    Update,
    /// Create or update
    #[default]
    Upsert,
}

/// Input of an import job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportPayload {
    pub model_id: String,
    pub asset_id: String,
    pub format: ImportFormat,
    #[serde(default)]
    pub strategy: ImportStrategy,
    /// Field receiving feature geometry for `geo_json` imports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_field: Option<String>,
}

impl ImportPayload {
    pub fn new(model_id: impl Into<String>, asset_id: impl Into<String>, format: ImportFormat) -> Self {
        Self {
            model_id: model_id.into(),
            asset_id: asset_id.into(),
            format,
            strategy: ImportStrategy::default(),
            geo_field: None,
        }
    }

    pub fn with_strategy(mut self, strategy: ImportStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_geo_field(mut self, field: impl Into<String>) -> Self {
        self.geo_field = Some(field.into());
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Outcome counters of a finished import.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImportResult {
    pub total: u64,
    pub inserted: u64,
    pub updated: u64,
    pub ignored: u64,
}

impl ImportResult {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
