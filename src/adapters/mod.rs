pub mod admin;
pub mod file_config;
pub mod health_checker;
pub mod http_client;
pub mod http_handler;

pub use file_config::FileConfigProvider;
pub use health_checker::HealthChecker;
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
