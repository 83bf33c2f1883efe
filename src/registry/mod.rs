//! Client adapter for the shared configuration registry.
//!
//! The registry is an external hierarchical key/value store navigated with a
//! stateful directory cursor. This module defines the contract the framework
//! needs from it ([`Registry`]) and the port-resolution adapter that looks up
//! transport addresses under the well-known `Ports` directory.
//!
//! Cursor discipline: [`resolve_port`] remembers the cursor before navigating
//! and restores it on every exit path, including when the `Ports` directory
//! itself is missing. No lookup leaks cursor state to the next caller.

pub mod memory;

pub use memory::MemoryRegistry;

use crate::error::RegistryError;
use async_trait::async_trait;

/// Name of the directory at the registry root that holds port keys.
pub const PORT_NAMESPACE: &str = "Ports";

/// Number of leading characters of the device name used as the lookup
/// pattern when no explicit registry key is configured.
const NAME_PREFIX_LEN: usize = 4;

/// Contract required from the configuration registry.
///
/// Paths are absolute when they begin with an empty segment (`["", "Ports"]`),
/// mirroring the registry's own addressing convention.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Change the cursor. `None` leaves it in place. Returns the previous
    /// cursor path so the caller can restore it later.
    async fn cd(&self, path: Option<&[String]>) -> Result<Vec<String>, RegistryError>;

    /// List the current directory as `(subdirectories, keys)`.
    async fn dir(&self) -> Result<(Vec<String>, Vec<String>), RegistryError>;

    /// Read a key in the current directory.
    async fn get(&self, key: &str) -> Result<String, RegistryError>;
}

/// A resolved port entry: the registry key that matched and its stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPort {
    /// Registry key that matched the lookup pattern.
    pub key: String,
    /// Stored transport address (IP, port name, or bus resource identifier).
    pub value: String,
}

/// Resolve a transport address from the `Ports` directory.
///
/// When `reg_key` is `None` the lookup pattern is the first four characters
/// of `device_name`, lowercased. The first key containing the pattern wins;
/// ordering among multiple matches is registry-listing order.
///
/// # Errors
///
/// - [`RegistryError::NotConfigured`] if the `Ports` directory is missing.
/// - [`RegistryError::KeyNotFound`] if no key contains the pattern.
///
/// The cursor is restored before returning in all cases.
pub async fn resolve_port(
    registry: &dyn Registry,
    device_name: &str,
    reg_key: Option<&str>,
) -> Result<ResolvedPort, RegistryError> {
    let previous = registry.cd(None).await?;
    let result = lookup(registry, device_name, reg_key).await;
    // Restore even when the lookup failed; a failed restore must not mask
    // the lookup error.
    let _ = registry.cd(Some(&previous)).await;
    result
}

async fn lookup(
    registry: &dyn Registry,
    device_name: &str,
    reg_key: Option<&str>,
) -> Result<ResolvedPort, RegistryError> {
    let namespace = vec![String::new(), PORT_NAMESPACE.to_string()];
    registry
        .cd(Some(&namespace))
        .await
        .map_err(|_| RegistryError::NotConfigured(PORT_NAMESPACE.to_string()))?;

    let (_subdirs, keys) = registry.dir().await?;

    let pattern = match reg_key {
        Some(key) => key.to_string(),
        None => device_name
            .chars()
            .take(NAME_PREFIX_LEN)
            .collect::<String>()
            .to_lowercase(),
    };

    let matched = keys
        .iter()
        .find(|key| key.contains(&pattern))
        .ok_or_else(|| RegistryError::KeyNotFound {
            pattern: pattern.clone(),
            namespace: PORT_NAMESPACE.to_string(),
        })?;

    let value = registry.get(matched).await?;
    Ok(ResolvedPort {
        key: matched.clone(),
        value,
    })
}
