//! Built-in policy plugins and the factory that constructs them from
//! available-plugin declarations.
pub mod circuit_breaker;
pub mod consistency;
pub mod cors;
pub mod interface_auth;
pub mod ip_whitelist;
pub mod rate_limit;

use std::sync::Arc;

use crate::{
    config::models::PluginDecl,
    core::plugin::{Plugin, PluginError},
};

pub use circuit_breaker::CircuitBreakerPlugin;
pub use consistency::ConsistencyPlugin;
pub use cors::CorsPlugin;
pub use interface_auth::InterfaceAuthPlugin;
pub use ip_whitelist::IpWhitelistPlugin;
pub use rate_limit::RateLimitPlugin;

/// Every plugin name the registry can build.
pub const BUILTIN_NAMES: [&str; 6] = [
    rate_limit::NAME,
    circuit_breaker::NAME,
    interface_auth::NAME,
    ip_whitelist::NAME,
    consistency::NAME,
    cors::NAME,
];

/// Construct a plugin instance from its declaration. The declaration's
/// `order` becomes the instance's chain position; its `config` bag is
/// interpreted by the plugin and rejected with a config error if malformed.
pub fn build(decl: &PluginDecl) -> Result<Arc<dyn Plugin>, PluginError> {
    let plugin: Arc<dyn Plugin> = match decl.name.as_str() {
        rate_limit::NAME => Arc::new(RateLimitPlugin::new(decl.order, &decl.config)?),
        circuit_breaker::NAME => Arc::new(CircuitBreakerPlugin::new(decl.order, &decl.config)?),
        interface_auth::NAME => Arc::new(InterfaceAuthPlugin::new(decl.order, &decl.config)?),
        ip_whitelist::NAME => Arc::new(IpWhitelistPlugin::new(decl.order, &decl.config)?),
        consistency::NAME => Arc::new(ConsistencyPlugin::new(decl.order, &decl.config)?),
        cors::NAME => Arc::new(CorsPlugin::new(decl.order, &decl.config)?),
        other => return Err(PluginError::Unknown(other.to_string())),
    };
    Ok(plugin)
}
