//! Credential resolution for stdio backends.
//!
//! A server's configuration declares `ENV_VAR → secret reference` pairs. The
//! supervisor hands that mapping to a `CredentialResolver` right before
//! spawning, and the resolved values are injected into the child's
//! environment only. They are never stored in the registry or logged.

use std::collections::HashMap;

use async_trait::async_trait;

/// Turns declared secret references into concrete environment variables.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolve every entry of `mapping` (env var name → secret reference).
    ///
    /// An error aborts the start; the message ends up in `StartFailed`.
    async fn resolve(
        &self,
        server: &str,
        mapping: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, String>;
}

/// Resolves each secret reference as the name of a variable in the router's
/// own environment.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialResolver;

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(
        &self,
        server: &str,
        mapping: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, String> {
        mapping
            .iter()
            .map(|(var, reference)| {
                std::env::var(reference)
                    .map(|value| (var.clone(), value))
                    .map_err(|_| {
                        format!("credential '{reference}' for {server}.{var} is not available")
                    })
            })
            .collect()
    }
}
