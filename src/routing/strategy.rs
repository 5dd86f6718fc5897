// src/routing/strategy.rs
//! Instance selection strategies

use crate::fleet::instance::Instance;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the router picks among healthy instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Per-type cursor modulo the current healthy count
    #[default]
    RoundRobin,
    /// Fewest in-flight requests, ties broken by port order
    LeastConnections,
    /// Uniform over the healthy set
    Random,
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RoutingStrategy::RoundRobin => "round-robin",
            RoutingStrategy::LeastConnections => "least-connections",
            RoutingStrategy::Random => "random",
        };
        f.write_str(label)
    }
}

impl FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(RoutingStrategy::RoundRobin),
            "least-connections" => Ok(RoutingStrategy::LeastConnections),
            "random" => Ok(RoutingStrategy::Random),
            other => Err(format!("unknown routing strategy: {}", other)),
        }
    }
}

/// Applies a [`RoutingStrategy`], keeping the round-robin cursors
#[derive(Debug)]
pub struct Selector {
    strategy: RoutingStrategy,
    cursors: DashMap<String, usize>,
}

impl Selector {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            cursors: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Pick one of `candidates`; `None` only when the slice is empty
    pub fn select<'a>(&self, agent_type: &str, candidates: &'a [Instance]) -> Option<&'a Instance> {
        if candidates.is_empty() {
            return None;
        }

        match self.strategy {
            RoutingStrategy::RoundRobin => {
                // index re-derived from the current length so a shrinking set
                // never goes out of range; fairness under churn is approximate
                let mut cursor = self.cursors.entry(agent_type.to_string()).or_insert(0);
                let index = *cursor % candidates.len();
                *cursor = cursor.wrapping_add(1);
                candidates.get(index)
            }
            RoutingStrategy::LeastConnections => candidates
                .iter()
                .min_by_key(|instance| instance.active_connections),
            RoutingStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..candidates.len());
                candidates.get(index)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::registry::tests::running;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn fleet(ports: &[u16]) -> Vec<Instance> {
        ports.iter().map(|port| running("odds", *port)).collect()
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("round-robin".parse::<RoutingStrategy>().unwrap(), RoutingStrategy::RoundRobin);
        assert_eq!(
            "least_connections".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::LeastConnections
        );
        assert_eq!("Random".parse::<RoutingStrategy>().unwrap(), RoutingStrategy::Random);
        assert!("fastest".parse::<RoutingStrategy>().is_err());
        assert_eq!(RoutingStrategy::LeastConnections.to_string(), "least-connections");
    }

    #[test]
    fn test_empty_set_yields_none() {
        for strategy in [
            RoutingStrategy::RoundRobin,
            RoutingStrategy::LeastConnections,
            RoutingStrategy::Random,
        ] {
            assert!(Selector::new(strategy).select("odds", &[]).is_none());
        }
    }

    #[test]
    fn test_least_connections_picks_minimum() {
        let mut instances = fleet(&[3201, 3202, 3203]);
        for (instance, connections) in instances.iter_mut().zip([5, 1, 3]) {
            instance.active_connections = connections;
        }

        let selector = Selector::new(RoutingStrategy::LeastConnections);
        assert_eq!(selector.select("odds", &instances).unwrap().port, 3202);
    }

    #[test]
    fn test_least_connections_ties_by_order() {
        let instances = fleet(&[3201, 3202, 3203]);
        let selector = Selector::new(RoutingStrategy::LeastConnections);
        assert_eq!(selector.select("odds", &instances).unwrap().port, 3201);
    }

    #[test]
    fn test_round_robin_survives_shrinking_set() {
        let selector = Selector::new(RoutingStrategy::RoundRobin);
        let three = fleet(&[3201, 3202, 3203]);
        let one = fleet(&[3201]);

        selector.select("odds", &three);
        selector.select("odds", &three);
        // cursor now 2, beyond the single-instance set
        assert_eq!(selector.select("odds", &one).unwrap().port, 3201);
    }

    #[test]
    fn test_round_robin_cursors_are_per_type() {
        let selector = Selector::new(RoutingStrategy::RoundRobin);
        let odds = fleet(&[3201, 3202]);
        let scorer = fleet(&[3301, 3302]);

        assert_eq!(selector.select("odds", &odds).unwrap().port, 3201);
        assert_eq!(selector.select("scorer", &scorer).unwrap().port, 3301);
        assert_eq!(selector.select("odds", &odds).unwrap().port, 3202);
    }

    #[test]
    fn test_random_stays_in_set() {
        let selector = Selector::new(RoutingStrategy::Random);
        let instances = fleet(&[3201, 3202, 3203]);
        for _ in 0..100 {
            let port = selector.select("odds", &instances).unwrap().port;
            assert!((3201..=3203).contains(&port));
        }
    }

    proptest! {
        #[test]
        fn prop_round_robin_is_balanced(k in 1usize..8, n in 0usize..200) {
            let ports: Vec<u16> = (0..k as u16).map(|i| 3201 + i).collect();
            let instances = fleet(&ports);
            let selector = Selector::new(RoutingStrategy::RoundRobin);

            let mut visits: HashMap<u16, usize> = HashMap::new();
            for _ in 0..n {
                let port = selector.select("odds", &instances).unwrap().port;
                *visits.entry(port).or_default() += 1;
            }

            for port in ports {
                let count = visits.get(&port).copied().unwrap_or(0);
                prop_assert!(count == n / k || count == n.div_ceil(k));
            }
        }

        #[test]
        fn prop_least_connections_is_minimal(connections in prop::collection::vec(0u64..20, 1..8)) {
            let ports: Vec<u16> = (0..connections.len() as u16).map(|i| 3201 + i).collect();
            let mut instances = fleet(&ports);
            for (instance, active) in instances.iter_mut().zip(&connections) {
                instance.active_connections = *active;
            }

            let selector = Selector::new(RoutingStrategy::LeastConnections);
            let chosen = selector.select("odds", &instances).unwrap();
            prop_assert_eq!(chosen.active_connections, *connections.iter().min().unwrap());
        }
    }
}
