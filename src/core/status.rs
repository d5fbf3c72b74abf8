//! Build outcome of every router, service and middleware of a snapshot.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ports::events::Protocol;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    Enabled,
    /// Built, but with problems that did not prevent it from serving.
    Warning,
    /// Excluded from the published routers.
    Disabled,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntityStatus {
    pub status: EntityState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub used_by: Vec<String>,
}

impl Default for EntityStatus {
    fn default() -> Self {
        Self {
            status: EntityState::Enabled,
            errors: Vec::new(),
            used_by: Vec::new(),
        }
    }
}

impl EntityStatus {
    pub fn add_error(&mut self, err: impl fmt::Display) {
        self.status = EntityState::Disabled;
        self.errors.push(err.to_string());
    }

    pub fn add_warning(&mut self, err: impl fmt::Display) {
        if self.status == EntityState::Enabled {
            self.status = EntityState::Warning;
        }
        self.errors.push(err.to_string());
    }

    pub fn is_enabled(&self) -> bool {
        self.status != EntityState::Disabled
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SectionStatus {
    pub routers: BTreeMap<String, EntityStatus>,
    pub services: BTreeMap<String, EntityStatus>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub middlewares: BTreeMap<String, EntityStatus>,
}

impl SectionStatus {
    pub fn router(&mut self, name: &str) -> &mut EntityStatus {
        self.routers.entry(name.to_string()).or_default()
    }

    pub fn service(&mut self, name: &str) -> &mut EntityStatus {
        self.services.entry(name.to_string()).or_default()
    }

    pub fn middleware(&mut self, name: &str) -> &mut EntityStatus {
        self.middlewares.entry(name.to_string()).or_default()
    }

    /// Records `router` on the services and middlewares it references.
    /// References to entities that do not exist are skipped.
    pub fn mark_used(&mut self, router: &str, service: &str, middlewares: &[String]) {
        if let Some(status) = self.services.get_mut(service) {
            push_unique(&mut status.used_by, router);
        }
        for name in middlewares {
            if let Some(status) = self.middlewares.get_mut(name) {
                push_unique(&mut status.used_by, router);
            }
        }
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
        list.sort();
    }
}

/// The status surface: what was built from one snapshot and what was not.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuntimeStatus {
    pub generation: u64,
    pub built_at: DateTime<Utc>,
    pub http: SectionStatus,
    pub tcp: SectionStatus,
    pub udp: SectionStatus,
}

impl RuntimeStatus {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            built_at: Utc::now(),
            http: SectionStatus::default(),
            tcp: SectionStatus::default(),
            udp: SectionStatus::default(),
        }
    }

    pub fn section(&self, protocol: Protocol) -> &SectionStatus {
        match protocol {
            Protocol::Http => &self.http,
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
        }
    }

    /// Every entity with at least one error, keyed like `http.routers.api`.
    pub fn errors(&self) -> BTreeMap<String, Vec<String>> {
        let mut errors = BTreeMap::new();
        for protocol in [Protocol::Http, Protocol::Tcp, Protocol::Udp] {
            let section = self.section(protocol);
            for (kind, entities) in [
                ("routers", &section.routers),
                ("services", &section.services),
                ("middlewares", &section.middlewares),
            ] {
                for (name, status) in entities {
                    if !status.errors.is_empty() {
                        errors.insert(
                            format!("{}.{kind}.{name}", protocol.as_str()),
                            status.errors.clone(),
                        );
                    }
                }
            }
        }
        errors
    }

    pub fn is_clean(&self) -> bool {
        self.errors().is_empty()
    }
}
