use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ApiKey;

use super::server_descriptor::ServerDescriptor;

/// The backend flavor an [`Endpoint`] talks to.
///
/// Mirrors the host project's per-provider `LLMConfiguration` tagging, but
/// as a plain enum since the resource hints below apply across providers
/// rather than being nested inside each variant's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Provider {
    Vllm,
    Sglang,
    Ollama,
    OpenAi,
    Anthropic,
    Custom,
}

impl Provider {
    /// `true` for providers whose serving footprint is tracked by the memory
    /// accountant (`spec.md` §4.3).
    #[must_use]
    pub fn is_memory_tracked(self) -> bool {
        matches!(self, Provider::Vllm | Provider::Sglang)
    }

    /// `true` for providers with no locally-managed process (`spec.md` §4.1,
    /// "Hosted").
    #[must_use]
    pub fn is_hosted(self) -> bool {
        matches!(
            self,
            Provider::OpenAi | Provider::Anthropic | Provider::Custom | Provider::Ollama
        )
    }

    /// Default port base for monotonic port assignment (`spec.md` §4.1).
    #[must_use]
    pub fn default_port_base(self) -> u16 {
        match self {
            Provider::Ollama => 11434,
            Provider::Vllm | Provider::Sglang | Provider::OpenAi | Provider::Custom => 8000,
            Provider::Anthropic => 8000,
        }
    }

    /// Binary invoked for local-exec and remote-ssh-exec transports
    /// (`spec.md` §4.1, "Local-exec"). Only meaningful for non-hosted
    /// providers.
    #[must_use]
    pub fn binary_name(self) -> &'static str {
        match self {
            Provider::Vllm => "vllm",
            Provider::Sglang => "sglang",
            Provider::Ollama => "ollama",
            Provider::OpenAi | Provider::Anthropic | Provider::Custom => "",
        }
    }
}

/// Resource hints for local-process backends (`spec.md` §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceHints {
    /// Fraction of device memory reserved for this backend, `(0, 1]`.
    #[serde(default)]
    pub gpu_memory_utilization: Option<f64>,
    #[serde(default)]
    pub max_model_len: Option<u32>,
    #[serde(default = "default_tensor_parallel_size")]
    pub tensor_parallel_size: u32,
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_tensor_parallel_size() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub provider: Provider,
    pub base_url: Url,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<ApiKey>,
    #[serde(default)]
    pub server: Option<ServerDescriptor>,
    #[serde(default)]
    pub resource_hints: ResourceHints,
}

impl Endpoint {
    /// `provider|baseUrl|model`, used by admission to detect contention over
    /// the same serving instance (`spec.md` GLOSSARY, "Model key").
    #[must_use]
    pub fn model_key(&self) -> String {
        format!("{}|{}|{}", self.provider, self.base_url, self.model)
    }

    /// The `(provider, host:port)` key used for memory reservation
    /// accounting (`spec.md` §3, `MemoryReservation`).
    #[must_use]
    pub fn reservation_host_key(&self) -> String {
        let host = self.base_url.host_str().unwrap_or("unknown");
        match self.base_url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// `gpuMemoryUtilization`, defaulting to `1.0` when unset (the endpoint
    /// then claims the entire effective cap; mirrors the spec's "optional
    /// resource hints" wording — a vLLM/SGLang endpoint with no explicit
    /// hint still occupies a slot, it just isn't memory-scoped precisely).
    #[must_use]
    pub fn reserved_fraction(&self) -> f64 {
        self.resource_hints.gpu_memory_utilization.unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(base_url: &str) -> Endpoint {
        Endpoint {
            provider: Provider::Vllm,
            base_url: Url::parse(base_url).unwrap(),
            model: "qwen2.5-7b".to_string(),
            api_key: None,
            server: None,
            resource_hints: ResourceHints {
                gpu_memory_utilization: Some(0.8),
                ..Default::default()
            },
        }
    }

    #[test]
    fn model_key_includes_provider_url_and_model() {
        let e = endpoint("http://127.0.0.1:8001/v1");
        let key = e.model_key();
        assert!(key.contains("vllm"));
        assert!(key.contains("8001"));
        assert!(key.contains("qwen2.5-7b"));
    }

    #[test]
    fn reservation_host_key_includes_port() {
        let e = endpoint("http://127.0.0.1:8001/v1");
        assert_eq!(e.reservation_host_key(), "127.0.0.1:8001");
    }

    #[test]
    fn reserved_fraction_defaults_to_one() {
        let mut e = endpoint("http://127.0.0.1:8001/v1");
        e.resource_hints.gpu_memory_utilization = None;
        assert!((e.reserved_fraction() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn hosted_providers_skip_memory_tracking() {
        assert!(!Provider::OpenAi.is_memory_tracked());
        assert!(!Provider::Ollama.is_memory_tracked());
        assert!(Provider::Vllm.is_memory_tracked());
        assert!(Provider::Sglang.is_memory_tracked());
    }
}
