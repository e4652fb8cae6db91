pub mod config_providers;
pub mod http_client;
pub mod http_handler;

pub use config_providers::FileConfigProvider;
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
