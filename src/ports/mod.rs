//! Ports: the traits external collaborators implement.
pub mod certificates;
pub mod config_provider;
pub mod events;
pub mod http_client;
