use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use crate::model::Provider;

/// Readiness path appended to an endpoint's base URL, per provider shape
/// (`spec.md` §4.1, `checkHealth`).
fn readiness_path(provider: Provider) -> &'static str {
    match provider {
        Provider::Ollama => "/api/tags",
        Provider::Vllm | Provider::Sglang | Provider::OpenAi | Provider::Anthropic | Provider::Custom => {
            "/v1/models"
        }
    }
}

/// Polls a provider-appropriate readiness endpoint with exponential
/// backoff capped at 2s per attempt, until success or `timeout` elapses.
pub async fn check_health(client: &reqwest::Client, provider: Provider, base_url: &Url, timeout: Duration) -> bool {
    let Ok(probe_url) = base_url.join(readiness_path(provider)) else {
        return false;
    };

    let deadline = Instant::now() + timeout;
    let mut backoff = Duration::from_millis(200);
    const MAX_BACKOFF: Duration = Duration::from_secs(2);

    loop {
        if probe_once(client, &probe_url).await {
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(backoff.min(remaining)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);

        if Instant::now() >= deadline {
            return false;
        }
    }
}

async fn probe_once(client: &reqwest::Client, url: &Url) -> bool {
    match client.get(url.clone()).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_path_is_ollama_specific() {
        assert_eq!(readiness_path(Provider::Ollama), "/api/tags");
        assert_eq!(readiness_path(Provider::Vllm), "/v1/models");
        assert_eq!(readiness_path(Provider::OpenAi), "/v1/models");
    }

    #[tokio::test]
    async fn times_out_against_an_unreachable_host() {
        let client = reqwest::Client::new();
        let url = Url::parse("http://127.0.0.1:1").unwrap();
        let healthy = check_health(&client, Provider::Vllm, &url, Duration::from_millis(300)).await;
        assert!(!healthy);
    }
}
