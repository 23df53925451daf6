use serde::{Deserialize, Serialize};

use super::endpoint::Endpoint;

/// Free-form catalog metadata, all optional (`spec.md` §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// A subagent's persona text, optionally machine-enhanced from the base
/// text by a model recorded alongside the result (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Personality {
    pub base_text: String,
    #[serde(default)]
    pub enhanced_text: Option<String>,
    #[serde(default)]
    pub enhanced_source_model: Option<String>,
    #[serde(default)]
    pub enhanced_at: Option<String>,
}

/// The endpoint a subagent binds to, plus ordered fallbacks tried in order
/// if the primary repeatedly fails admission or health checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBinding {
    pub endpoint: Endpoint,
    #[serde(default)]
    pub fallback_endpoints: Vec<Endpoint>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    2
}

/// Generation and lifecycle tuning for a subagent (`spec.md` §3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Behavior {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub auto_load: bool,
    #[serde(default)]
    pub auto_unload: bool,
    #[serde(default)]
    pub unload_delay_ms: u64,
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_run_time_ms: Option<u64>,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: u32,
}

fn default_concurrency_limit() -> u32 {
    1
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior {
            temperature: None,
            top_p: None,
            max_tokens: None,
            auto_load: false,
            auto_unload: false,
            unload_delay_ms: 0,
            idle_timeout_ms: None,
            max_run_time_ms: None,
            concurrency_limit: default_concurrency_limit(),
        }
    }
}

/// A catalog entry describing one subagent's identity, model binding, and
/// lifecycle behavior (`spec.md` §3, C6).
///
/// `id` is the catalog's primary key; [`crate::catalog::SubagentCatalog::upsert`]
/// replaces an entry in place when it matches an existing id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub personality: Option<Personality>,
    pub model: ModelBinding,
    #[serde(default)]
    pub behavior: Behavior,
}

impl SubagentDefinition {
    /// Deep copy under a fresh id and name, preserving model and behavior
    /// (`spec.md` §4.6, `duplicate`).
    #[must_use]
    pub fn duplicated_as(&self, new_id: impl Into<String>, new_name: impl Into<String>) -> Self {
        SubagentDefinition {
            id: new_id.into(),
            name: new_name.into(),
            description: self.description.clone(),
            metadata: self.metadata.clone(),
            personality: self.personality.clone(),
            model: self.model.clone(),
            behavior: self.behavior.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Provider;
    use url::Url;

    fn definition() -> SubagentDefinition {
        SubagentDefinition {
            id: "coder".to_string(),
            name: "Coder".to_string(),
            description: "writes code".to_string(),
            metadata: Metadata::default(),
            personality: None,
            model: ModelBinding {
                endpoint: Endpoint {
                    provider: Provider::Vllm,
                    base_url: Url::parse("http://127.0.0.1:8001/v1").unwrap(),
                    model: "qwen2.5-7b".to_string(),
                    api_key: None,
                    server: None,
                    resource_hints: crate::model::ResourceHints {
                        gpu_memory_utilization: Some(0.8),
                        ..Default::default()
                    },
                },
                fallback_endpoints: vec![],
                max_retries: 2,
            },
            behavior: Behavior {
                auto_load: true,
                auto_unload: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn duplicate_preserves_model_and_behavior_under_new_identity() {
        let original = definition();
        let copy = original.duplicated_as("coder-2", "Coder Copy");
        assert_eq!(copy.id, "coder-2");
        assert_eq!(copy.name, "Coder Copy");
        assert_eq!(copy.model.endpoint.model, original.model.endpoint.model);
        assert_eq!(copy.behavior.auto_load, original.behavior.auto_load);
    }

    #[test]
    fn default_behavior_has_no_auto_load_and_concurrency_one() {
        let b = Behavior::default();
        assert!(!b.auto_load);
        assert_eq!(b.concurrency_limit, 1);
    }
}
