pub(crate) mod auth;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod errors;
pub(crate) mod handlers;
pub(crate) mod metrics;
pub(crate) mod notify;
pub(crate) mod router;
pub(crate) mod search;
pub(crate) mod token_repository;
pub(crate) mod types;

pub use self::core::AppConfig;
pub use errors::init_tracing;
pub use router::build_router;
