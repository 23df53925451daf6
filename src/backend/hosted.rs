use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CrateError, RegistryKey, Result};
use crate::model::{Endpoint, ProcessEntry};

use super::driver::{BackendContext, BackendDriver, LaunchOutcome};
use super::health::check_health;

/// Covers `openai`/`anthropic`/`custom` endpoints with no locally-managed
/// process, and `ollama` (treated as an externally managed daemon) —
/// `spec.md` §4.1, "Hosted".
pub struct HostedDriver {
    ctx: Arc<BackendContext>,
}

impl HostedDriver {
    #[must_use]
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        HostedDriver { ctx }
    }
}

#[async_trait]
impl BackendDriver for HostedDriver {
    async fn start(&self, key: &RegistryKey, endpoint: &Endpoint) -> Result<LaunchOutcome> {
        let healthy = check_health(
            &self.ctx.http_client,
            endpoint.provider,
            &endpoint.base_url,
            self.ctx.health_check_timeout,
        )
        .await;

        if !healthy {
            return Err(CrateError::HealthTimeout {
                key: key.clone(),
                timeout_secs: self.ctx.health_check_timeout.as_secs(),
            });
        }

        Ok(LaunchOutcome {
            base_url: endpoint.base_url.clone(),
            pid: None,
            container_id: None,
        })
    }

    async fn stop(&self, _entry: &ProcessEntry) -> Result<()> {
        Ok(())
    }
}
