use tokio::sync::Mutex;

use crate::model::Provider;

/// Monotonically increasing port allocator, seeded per provider base
/// (`spec.md` §4.1, "Port assignment").
///
/// A collision between two independently-started processes surfaces
/// downstream as a health-check timeout rather than being detected here —
/// this allocator does not probe whether a port is actually free.
pub struct PortAllocator {
    next: Mutex<u16>,
}

impl PortAllocator {
    #[must_use]
    pub fn new(base: u16) -> Self {
        PortAllocator {
            next: Mutex::new(base),
        }
    }

    #[must_use]
    pub fn for_provider(provider: Provider) -> Self {
        PortAllocator::new(provider.default_port_base())
    }

    pub async fn next_port(&self) -> u16 {
        let mut guard = self.next.lock().await;
        let port = *guard;
        *guard = guard.saturating_add(1);
        port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_monotonically_increasing_ports() {
        let allocator = PortAllocator::new(8000);
        let a = allocator.next_port().await;
        let b = allocator.next_port().await;
        let c = allocator.next_port().await;
        assert_eq!((a, b, c), (8000, 8001, 8002));
    }

    #[tokio::test]
    async fn for_provider_uses_provider_default_base() {
        let allocator = PortAllocator::for_provider(Provider::Ollama);
        assert_eq!(allocator.next_port().await, 11434);
    }
}
