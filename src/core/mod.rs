pub mod error;
pub mod factory;
pub mod handler;
pub mod middleware;
pub mod reconciler;
pub mod router;
pub mod rule;
pub mod service;
pub mod status;

pub use error::{ConfigError, DispatchError};
pub use factory::{BuiltRouters, RouterFactory};
pub use reconciler::Reconciler;
pub use status::RuntimeStatus;
