//! Per-entry-point routers.
//!
//! Routers are immutable once built. Every router family keeps its routes in
//! the same total order: explicit priority first, then rule specificity, then
//! name. The first matching route in that order wins.

pub mod http;
pub mod sni;
pub mod tcp;
pub mod udp;

use std::cmp::Ordering;

pub use self::{
    http::{HttpRoute, HttpRouter, serve_connection},
    tcp::{TcpRoute, TcpRouteTls, TcpRouter, TcpRouterBuilder, TlsAcceptors},
    udp::{UdpRoute, UdpRouter},
};
use crate::core::rule::Specificity;

/// Sort key of a route. `Ord` puts the route that should be tried first
/// at the front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteKey {
    pub name: String,
    pub priority: i64,
    pub specificity: Specificity,
}

impl RouteKey {
    pub fn new(name: impl Into<String>, priority: Option<i64>, specificity: Specificity) -> Self {
        Self {
            name: name.into(),
            priority: priority.unwrap_or(0),
            specificity,
        }
    }
}

impl Ord for RouteKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.specificity.cmp(&self.specificity))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for RouteKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
