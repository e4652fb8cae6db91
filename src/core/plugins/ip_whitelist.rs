//! Client IP access control: exact addresses plus CIDR ranges.
use std::net::IpAddr;

use async_trait::async_trait;
use http::StatusCode;
use ipnet::IpNet;
use scc::HashMap as ConcurrentMap;
use serde::Deserialize;

use crate::core::{
    context::RequestContext,
    plugin::{Plugin, PluginError, PluginOutcome, json_error},
};

pub const NAME: &str = "ip_whitelist";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    ip_whitelist: Vec<String>,
}

pub struct IpWhitelistPlugin {
    order: i32,
    /// Exact addresses in a concurrent map so runtime additions stay cheap.
    exact: ConcurrentMap<IpAddr, ()>,
    cidrs: Vec<IpNet>,
    empty: bool,
}

impl IpWhitelistPlugin {
    pub fn new(
        order: i32,
        config: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, PluginError> {
        let settings: Settings =
            serde_json::from_value(serde_json::Value::Object(config.clone()))
                .map_err(|e| PluginError::config(NAME, e.to_string()))?;

        let exact = ConcurrentMap::new();
        let mut cidrs = Vec::new();
        for entry in &settings.ip_whitelist {
            if let Ok(addr) = entry.parse::<IpAddr>() {
                let _ = exact.insert_sync(addr, ());
            } else if let Ok(net) = entry.parse::<IpNet>() {
                cidrs.push(net);
            } else {
                return Err(PluginError::config(
                    NAME,
                    format!("'{entry}' is neither an IP address nor a CIDR"),
                ));
            }
        }

        Ok(Self {
            order,
            empty: settings.ip_whitelist.is_empty(),
            exact,
            cidrs,
        })
    }

    async fn is_allowed(&self, addr: IpAddr) -> bool {
        if self.empty {
            return true;
        }
        if self.exact.contains_async(&addr).await {
            return true;
        }
        self.cidrs.iter().any(|net| net.contains(&addr))
    }
}

#[async_trait]
impl Plugin for IpWhitelistPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn execute(&self, ctx: &mut RequestContext) -> Result<PluginOutcome, PluginError> {
        if self.empty {
            return Ok(PluginOutcome::Continue);
        }

        let allowed = match ctx.client_ip {
            Some(addr) => self.is_allowed(addr).await,
            None => false,
        };

        if allowed {
            Ok(PluginOutcome::Continue)
        } else {
            tracing::debug!(client_ip = ?ctx.client_ip, "client IP not in whitelist");
            Ok(PluginOutcome::ShortCircuit(json_error(
                StatusCode::FORBIDDEN,
                "IP not in whitelist",
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::*;
    use crate::core::context::test_support::context;

    fn plugin(entries: serde_json::Value) -> IpWhitelistPlugin {
        IpWhitelistPlugin::new(
            5,
            serde_json::json!({ "ip_whitelist": entries }).as_object().unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn empty_whitelist_allows_everyone() {
        let plugin = plugin(serde_json::json!([]));
        let mut ctx = context(Method::GET, "/", "", "example.com");
        assert!(matches!(
            plugin.execute(&mut ctx).await.unwrap(),
            PluginOutcome::Continue
        ));
    }

    #[tokio::test]
    async fn exact_address_is_allowed() {
        let plugin = plugin(serde_json::json!(["127.0.0.1"]));
        let mut ctx = context(Method::GET, "/", "", "example.com");
        assert!(matches!(
            plugin.execute(&mut ctx).await.unwrap(),
            PluginOutcome::Continue
        ));
    }

    #[tokio::test]
    async fn cidr_range_is_allowed() {
        let plugin = plugin(serde_json::json!(["10.1.0.0/16"]));
        assert!(plugin.is_allowed("10.1.3.4".parse().unwrap()).await);
        assert!(!plugin.is_allowed("10.2.0.1".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn unlisted_address_is_denied_with_403() {
        let plugin = plugin(serde_json::json!(["192.168.0.0/24"]));
        let mut ctx = context(Method::GET, "/", "", "example.com");
        match plugin.execute(&mut ctx).await.unwrap() {
            PluginOutcome::ShortCircuit(response) => {
                assert_eq!(response.status(), StatusCode::FORBIDDEN)
            }
            PluginOutcome::Continue => panic!("expected 403"),
        }
    }

    #[test]
    fn garbage_entry_fails_init() {
        let config = serde_json::json!({"ip_whitelist": ["not-an-ip"]});
        assert!(IpWhitelistPlugin::new(5, config.as_object().unwrap()).is_err());
    }
}
