pub mod chain;
pub mod context;
pub mod dispatcher;
pub mod gateway;
pub mod plugin;
pub mod plugins;
pub mod proxy;
pub mod registry;
pub mod result_cache;
pub mod router;
pub mod snapshot;

pub use dispatcher::Dispatcher;
pub use gateway::{GatewayError, GatewayService, LifecycleEvent};
