use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;

use super::target::RuntimeTarget;
use crate::config::LoadBalanceStrategy;

/// Trait defining the interface for load balancing strategies.
///
/// Strategies pick an index into the target list they were built for and
/// never return an unhealthy target.
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select a healthy target, or `None` if there is none.
    fn select(&self, targets: &[Arc<RuntimeTarget>]) -> Option<usize>;
    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Smooth weighted round-robin.
///
/// Every pick adds each healthy target's weight to its running score, takes
/// the highest score and subtracts the total weight from it. Weights 3 and 1
/// yield `a a b a`, so a heavy target never receives its share in one burst.
/// State is one score per target whatever the weights are. Weight 0 takes the
/// target out of rotation.
pub struct RoundRobinStrategy {
    weights: Vec<i64>,
    scores: Mutex<Vec<i64>>,
}

impl RoundRobinStrategy {
    pub fn new(weights: &[u32]) -> Self {
        Self {
            weights: weights.iter().map(|w| i64::from(*w)).collect(),
            scores: Mutex::new(vec![0; weights.len()]),
        }
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select(&self, targets: &[Arc<RuntimeTarget>]) -> Option<usize> {
        let mut scores = self.scores.lock().unwrap_or_else(PoisonError::into_inner);
        let mut total = 0i64;
        let mut best: Option<usize> = None;
        for (index, weight) in self.weights.iter().copied().enumerate() {
            if weight == 0 || !targets.get(index).is_some_and(|t| t.is_healthy()) {
                continue;
            }
            scores[index] += weight;
            total += weight;
            if best.is_none_or(|b| scores[index] > scores[b]) {
                best = Some(index);
            }
        }
        let best = best?;
        scores[best] -= total;
        Some(best)
    }
}

/// Weighted random selection among healthy targets.
pub struct RandomStrategy {
    weights: Vec<u32>,
}

impl RandomStrategy {
    pub fn new(weights: &[u32]) -> Self {
        Self {
            weights: weights.to_vec(),
        }
    }
}

impl LoadBalancingStrategy for RandomStrategy {
    fn select(&self, targets: &[Arc<RuntimeTarget>]) -> Option<usize> {
        let healthy_weight = |index: usize| {
            targets
                .get(index)
                .filter(|t| t.is_healthy())
                .map_or(0, |_| u64::from(self.weights[index]))
        };
        let total: u64 = (0..self.weights.len()).map(healthy_weight).sum();
        if total == 0 {
            return None;
        }
        let mut pick = rand::rng().random_range(0..total);
        for index in 0..self.weights.len() {
            let weight = healthy_weight(index);
            if pick < weight {
                return Some(index);
            }
            pick -= weight;
        }
        None
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    /// Create a new load balancing strategy based on configuration
    pub fn create_strategy(
        strategy: LoadBalanceStrategy,
        weights: &[u32],
    ) -> Box<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new(weights).boxed(),
            LoadBalanceStrategy::Random => RandomStrategy::new(weights).boxed(),
        }
    }
}

/// The targets of one service together with its selection strategy.
pub struct TargetPool {
    targets: Vec<Arc<RuntimeTarget>>,
    strategy: Box<dyn LoadBalancingStrategy>,
}

impl TargetPool {
    pub fn new(targets: Vec<Arc<RuntimeTarget>>, strategy: LoadBalanceStrategy) -> Self {
        let weights: Vec<u32> = targets.iter().map(|t| t.weight()).collect();
        Self {
            strategy: LoadBalancerFactory::create_strategy(strategy, &weights),
            targets,
        }
    }

    pub fn targets(&self) -> &[Arc<RuntimeTarget>] {
        &self.targets
    }

    pub fn select(&self) -> Option<&Arc<RuntimeTarget>> {
        self.strategy
            .select(&self.targets)
            .and_then(|index| self.targets.get(index))
    }

    /// Selects a healthy target other than `failed`, for a retry.
    pub fn select_other(&self, failed: &Arc<RuntimeTarget>) -> Option<&Arc<RuntimeTarget>> {
        for _ in 0..self.targets.len() {
            match self.select() {
                Some(target) if !Arc::ptr_eq(target, failed) => return Some(target),
                Some(_) => continue,
                None => return None,
            }
        }
        self.targets
            .iter()
            .find(|t| !Arc::ptr_eq(t, failed) && t.weight() > 0 && t.is_healthy())
    }

    /// The healthy target whose cookie value equals `value`, if any.
    pub fn find_sticky(&self, value: &str) -> Option<&Arc<RuntimeTarget>> {
        self.targets
            .iter()
            .find(|t| t.cookie_value() == value && t.weight() > 0 && t.is_healthy())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::core::service::target::{BackendUrl, TargetAddress};

    fn targets(weights: &[u32]) -> Vec<Arc<RuntimeTarget>> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let url = BackendUrl::new(&format!("http://10.0.0.{}:80", i + 1)).unwrap();
                Arc::new(RuntimeTarget::new(TargetAddress::Http(url), *w))
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let pool = targets(&[1, 1, 1]);
        let strategy = RoundRobinStrategy::new(&[1, 1, 1]);
        let picks: Vec<_> = (0..6).filter_map(|_| strategy.select(&pool)).collect();
        assert_eq!(picks, [0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn weights_are_interleaved() {
        let pool = targets(&[3, 1]);
        let strategy = RoundRobinStrategy::new(&[3, 1]);
        let picks: Vec<_> = (0..8).filter_map(|_| strategy.select(&pool)).collect();
        assert_eq!(picks, [0, 0, 1, 0, 0, 0, 1, 0]);
    }

    #[test]
    fn huge_weights_keep_state_per_target() {
        let pool = targets(&[u32::MAX, u32::MAX, 1]);
        let pool = TargetPool::new(pool, LoadBalanceStrategy::RoundRobin);
        let picks: Vec<_> = (0..4)
            .filter_map(|_| pool.select().map(|t| t.id().to_string()))
            .collect();
        assert_eq!(
            picks,
            [
                "http://10.0.0.1:80",
                "http://10.0.0.2:80",
                "http://10.0.0.1:80",
                "http://10.0.0.2:80"
            ]
        );
    }

    #[test]
    fn shares_follow_weights_over_a_cycle() {
        let pool = targets(&[5, 2, 1]);
        let strategy = RoundRobinStrategy::new(&[5, 2, 1]);
        let mut counts = [0; 3];
        for _ in 0..80 {
            counts[strategy.select(&pool).unwrap()] += 1;
        }
        assert_eq!(counts, [50, 20, 10]);
    }

    #[test]
    fn unhealthy_target_share_goes_to_the_rest() {
        let pool = targets(&[2, 1, 1]);
        let strategy = RoundRobinStrategy::new(&[2, 1, 1]);
        pool[0].mark_unhealthy();
        let picks: Vec<_> = (0..4).filter_map(|_| strategy.select(&pool)).collect();
        assert_eq!(picks, [1, 2, 1, 2]);
    }

    #[test]
    fn unhealthy_targets_are_never_picked() {
        let pool = targets(&[1, 1, 1]);
        pool[1].mark_unhealthy();
        for strategy in [
            LoadBalancerFactory::create_strategy(LoadBalanceStrategy::RoundRobin, &[1, 1, 1]),
            LoadBalancerFactory::create_strategy(LoadBalanceStrategy::Random, &[1, 1, 1]),
        ] {
            for _ in 0..100 {
                assert_ne!(strategy.select(&pool), Some(1));
            }
        }
    }

    #[test]
    fn zero_weight_and_empty_pools_select_nothing() {
        let pool = targets(&[0]);
        assert_eq!(RoundRobinStrategy::new(&[0]).select(&pool), None);
        assert_eq!(RandomStrategy::new(&[0]).select(&pool), None);
        assert_eq!(RoundRobinStrategy::new(&[]).select(&[]), None);
    }

    #[test]
    fn all_unhealthy_selects_nothing() {
        let pool = targets(&[2, 1]);
        for t in &pool {
            t.mark_unhealthy();
        }
        assert_eq!(RoundRobinStrategy::new(&[2, 1]).select(&pool), None);
        assert_eq!(RandomStrategy::new(&[2, 1]).select(&pool), None);
    }

    #[test]
    fn random_respects_weights_roughly() {
        let pool = targets(&[9, 1]);
        let strategy = RandomStrategy::new(&[9, 1]);
        let mut counts = HashMap::new();
        for _ in 0..2_000 {
            *counts.entry(strategy.select(&pool).unwrap()).or_insert(0) += 1;
        }
        assert!(counts[&0] > counts[&1] * 3);
    }

    #[test]
    fn select_other_avoids_failed_target() {
        let pool = TargetPool::new(targets(&[1, 1]), LoadBalanceStrategy::RoundRobin);
        let failed = pool.targets()[0].clone();
        for _ in 0..10 {
            let other = pool.select_other(&failed).unwrap();
            assert!(!Arc::ptr_eq(other, &failed));
        }
        pool.targets()[1].mark_unhealthy();
        assert!(pool.select_other(&failed).is_none());
    }
}
