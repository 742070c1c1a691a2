//! Address → embedded worker registry.
//!
//! Workers registered here are reached without a socket: [`client_for`]
//! hands back an [`EmbeddedClient`] for a registered address and a
//! [`NetworkClient`] for anything else, so call sites never branch.

use dashmap::DashMap;
use lazy_static::lazy_static;
use std::sync::Arc;
use tracing::info;

use super::backend::Backend;
use super::client::{NetworkClient, WorkerClient};
use super::embedded::EmbeddedClient;
use super::runtime::WorkerRuntime;

lazy_static! {
    static ref EMBEDDED: DashMap<String, Arc<WorkerRuntime>> = DashMap::new();
}

/// Registers `backend` under `address`, replacing any previous entry.
pub fn register(address: &str, backend: Arc<dyn Backend>) -> Arc<WorkerRuntime> {
    let runtime = Arc::new(WorkerRuntime::new(backend));
    info!("Registered embedded {} worker at {}", runtime.backend_name(), address);
    EMBEDDED.insert(address.to_string(), Arc::clone(&runtime));
    runtime
}

pub fn unregister(address: &str) -> bool {
    EMBEDDED.remove(address).is_some()
}

pub fn is_embedded(address: &str) -> bool {
    EMBEDDED.contains_key(address)
}

pub fn client_for(address: &str) -> Arc<dyn WorkerClient> {
    match EMBEDDED.get(address) {
        Some(runtime) => Arc::new(EmbeddedClient::new(address, Arc::clone(runtime.value()))),
        None => Arc::new(NetworkClient::new(address)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::CallContext;
    use async_trait::async_trait;

    struct Named;

    #[async_trait]
    impl Backend for Named {
        fn name(&self) -> &str {
            "named"
        }
    }

    #[tokio::test]
    async fn test_registered_address_is_served_in_process() {
        let address = "embedded://registry-test";
        register(address, Arc::new(Named));
        assert!(is_embedded(address));

        let client = client_for(address);
        assert_eq!(client.address(), address);
        // no socket involved, health answers immediately
        assert!(client.health_check(&CallContext::background()).await);

        assert!(unregister(address));
        assert!(!is_embedded(address));
    }

    #[test]
    fn test_unknown_address_gets_network_client() {
        let client = client_for("127.0.0.1:65000");
        assert_eq!(client.address(), "127.0.0.1:65000");
        assert!(!is_embedded("127.0.0.1:65000"));
    }
}
