use std::sync::Arc;

use super::{
    load_balancer::TargetPool,
    target::{RuntimeTarget, TargetAddress},
};
use crate::{
    config::UdpServiceConfig,
    core::error::{ConfigError, DispatchError},
};

/// Target selection for UDP sessions. Datagram relaying lives in the entry
/// point, which picks a target once per client session.
pub struct UdpService {
    name: String,
    pool: TargetPool,
}

impl UdpService {
    pub fn new(name: &str, config: &UdpServiceConfig) -> Result<Self, ConfigError> {
        let targets = config
            .servers
            .iter()
            .map(|server| {
                TargetAddress::socket(&server.address)
                    .map(|address| Arc::new(RuntimeTarget::new(address, server.weight)))
                    .map_err(|e| ConfigError::service(name, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.to_string(),
            pool: TargetPool::new(targets, config.strategy),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn targets(&self) -> &[Arc<RuntimeTarget>] {
        self.pool.targets()
    }

    pub fn select_target(&self) -> Result<Arc<RuntimeTarget>, DispatchError> {
        self.pool
            .select()
            .cloned()
            .ok_or_else(|| DispatchError::NoHealthyTarget(self.name.clone()))
    }
}
