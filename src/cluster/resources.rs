//! Shared resource types for minik8s cluster management

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// API version stamped on every resource
pub const API_VERSION: &str = "minik8s/v1";

/// Label set. Ordered so that structural hashes are stable.
pub type Labels = BTreeMap<String, String>;

static NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").ok());

/// Maximum length of a resource name
pub const MAX_NAME_LEN: usize = 253;

/// Check that a name is a lowercase DNS subdomain (`web-0`, `db.primary`)
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    NAME_PATTERN
        .as_ref()
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

/// Metadata common to every resource kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Unique name within the cluster
    pub name: String,

    /// Unique identifier (generated by the control plane)
    #[serde(default = "Uuid::new_v4")]
    pub uid: Uuid,

    /// Labels for organization and selection
    #[serde(default)]
    pub labels: Labels,

    /// Creation timestamp, stamped when the resource is first stored
    #[serde(rename = "creationTimestamp")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: Uuid::new_v4(),
            labels: Labels::new(),
            creation_timestamp: None,
        }
    }

    /// Stamp the system fields of a freshly created resource
    pub fn stamp(&mut self) {
        self.uid = Uuid::new_v4();
        self.creation_timestamp = Some(Utc::now());
    }
}

/// Response for listing resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceList<T> {
    /// API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Kind (e.g., "DeploymentList", "NodeList")
    pub kind: String,

    /// List of items
    pub items: Vec<T>,
}

impl<T> ResourceList<T> {
    /// Create a new resource list
    pub fn new(kind: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: kind.into(),
            items,
        }
    }
}

/// Label selector for filtering resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Match exact labels
    #[serde(rename = "matchLabels")]
    #[serde(default)]
    pub match_labels: Labels,
}

impl LabelSelector {
    /// Create a selector that matches a specific label
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = Labels::new();
        labels.insert(key.into(), value.into());
        Self {
            match_labels: labels,
        }
    }

    /// An empty selector selects nothing
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    /// Check if labels match this selector
    pub fn matches(&self, labels: &Labels) -> bool {
        !self.is_empty()
            && self
                .match_labels
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Status of an operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    /// Success or failure
    pub success: bool,

    /// Status message
    pub message: String,

    /// Details (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl OperationStatus {
    /// Create success status
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: None,
        }
    }

    /// Create failure status
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: None,
        }
    }

    /// Add details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
