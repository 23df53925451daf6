use serde::{Deserialize, Serialize};

use super::endpoint::Provider;

/// Key a memory reservation is tracked under: the provider and the
/// `host:port` of the endpoint it backs (`spec.md` §3, §4.3).
///
/// Two endpoints that resolve to the same `(provider, host:port)` share a
/// reservation — starting the second is a no-op for accounting purposes,
/// since it is, in practice, the same process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationKey {
    pub provider: Provider,
    pub host_port: String,
}

impl ReservationKey {
    #[must_use]
    pub fn new(provider: Provider, host_port: impl Into<String>) -> Self {
        ReservationKey {
            provider,
            host_port: host_port.into(),
        }
    }
}

impl std::fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.provider, self.host_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_provider_and_host_port_are_equal_keys() {
        let a = ReservationKey::new(Provider::Vllm, "127.0.0.1:8001");
        let b = ReservationKey::new(Provider::Vllm, "127.0.0.1:8001");
        assert_eq!(a, b);
    }

    #[test]
    fn different_host_port_is_a_different_key() {
        let a = ReservationKey::new(Provider::Vllm, "127.0.0.1:8001");
        let b = ReservationKey::new(Provider::Vllm, "127.0.0.1:8002");
        assert_ne!(a, b);
    }
}
