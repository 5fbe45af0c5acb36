//! clammit library: body capture, clamd scanning, interception and forwarding.

// Request pipeline
pub mod body;
pub mod forward;
pub mod intercept;
pub mod scanner;

// Serving
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;

pub use config::ClammitConfig;
pub use forward::Forwarder;
pub use http::ClammitServer;
pub use intercept::ScanInterceptor;
pub use lifecycle::{ShutdownCoordinator, ShutdownHandle};
pub use scanner::ClamdClient;
