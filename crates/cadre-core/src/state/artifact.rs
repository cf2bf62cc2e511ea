//! Side-channel outputs (files, images, structured data) attached to a `State`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    File,
    Image,
    Video,
    Audio,
    Document,
    Data,
    Model,
    Code,
    Log,
    Custom,
}

/// A named blob with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    pub size: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    pub created: DateTime<Utc>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, artifact_type: ArtifactType, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            artifact_type,
            mime_type: String::new(),
            size: data.len(),
            data,
            metadata: HashMap::new(),
            created: Utc::now(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Data interpreted as UTF-8, if it is valid text
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}
