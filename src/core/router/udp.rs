use std::sync::Arc;

use super::RouteKey;
use crate::core::{error::ConfigError, rule::Specificity, service::UdpService};

pub struct UdpRoute {
    pub key: RouteKey,
    pub service: Arc<UdpService>,
}

impl UdpRoute {
    pub fn new(name: impl Into<String>, priority: Option<i64>, service: Arc<UdpService>) -> Self {
        Self {
            key: RouteKey::new(name, priority, Specificity::default()),
            service,
        }
    }
}

/// UDP carries nothing to match on, so an entry point has at most one route.
pub struct UdpRouter {
    entry_point: String,
    route: Option<UdpRoute>,
}

impl UdpRouter {
    /// Keeps the best candidate (highest priority, then lowest name) and
    /// returns a conflict error for each of the others.
    pub fn elect(
        entry_point: impl Into<String>,
        mut candidates: Vec<UdpRoute>,
    ) -> (Self, Vec<(String, ConfigError)>) {
        let entry_point = entry_point.into();
        candidates.sort_by(|a, b| a.key.cmp(&b.key));
        let mut candidates = candidates.into_iter();
        let route = candidates.next();

        let conflicts = match &route {
            Some(winner) => candidates
                .map(|loser| {
                    let err = ConfigError::RouterConflict {
                        winner: winner.key.name.clone(),
                        entry_point: entry_point.clone(),
                    };
                    (loser.key.name, err)
                })
                .collect(),
            None => Vec::new(),
        };
        (Self { entry_point, route }, conflicts)
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn router_name(&self) -> Option<&str> {
        self.route.as_ref().map(|r| r.key.name.as_str())
    }

    pub fn service(&self) -> Option<&Arc<UdpService>> {
        self.route.as_ref().map(|r| &r.service)
    }
}
