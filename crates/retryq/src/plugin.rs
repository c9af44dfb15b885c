//! Versioned plugin contract.
//!
//! Plugins attach to a running engine, observe its lifecycle through hooks,
//! and may interpose middleware on the transport path.

use crate::hooks::RetryHooks;
use crate::middleware::Middleware;
use regex::Regex;
use std::sync::{Arc, OnceLock};

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("version pattern is valid"))
}

/// Where a plugin's middleware runs relative to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MiddlewarePlacement {
    /// Around each transport attempt, inside the retry loop.
    #[default]
    Inner,
    /// Around the whole logical request, outside admission and retries.
    Outer,
}

/// Options accepted at plugin registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginOptions {
    /// Middleware placement; `Outer` reinstalls the plugin's interception
    /// outside the engine's own processing.
    pub placement: MiddlewarePlacement,
}

/// A lifecycle plugin.
pub trait RetryPlugin: Send + Sync {
    /// Unique plugin name.
    fn name(&self) -> &str;

    /// Plugin version; must match `X.Y.Z`.
    fn version(&self) -> &str;

    /// Called once at registration with the engine being attached to.
    fn initialize(&self, engine: &crate::engine::RetryEngine) {
        let _ = engine;
    }

    /// Lifecycle hooks to attach to the engine's bus.
    fn hooks(&self) -> Option<Arc<dyn RetryHooks>> {
        None
    }

    /// Middleware to interpose on the transport path.
    fn middleware(&self) -> Option<Arc<dyn Middleware>> {
        None
    }

    /// Called just before the engine is destroyed or the plugin detached.
    fn on_before_destroyed(&self, engine: &crate::engine::RetryEngine) {
        let _ = engine;
    }
}

/// Validate a plugin's name/version for registration against the already
/// registered set.
pub(crate) fn validate_registration(
    plugin: &dyn RetryPlugin,
    registered_names: &[String],
) -> Result<(), String> {
    if !version_pattern().is_match(plugin.version()) {
        return Err(format!(
            "plugin '{}' has invalid version '{}' (expected X.Y.Z)",
            plugin.name(),
            plugin.version()
        ));
    }
    if registered_names.iter().any(|name| name == plugin.name()) {
        return Err(format!("plugin '{}' is already registered", plugin.name()));
    }
    Ok(())
}

pub(crate) struct RegisteredPlugin {
    pub plugin: Arc<dyn RetryPlugin>,
    pub placement: MiddlewarePlacement,
}
