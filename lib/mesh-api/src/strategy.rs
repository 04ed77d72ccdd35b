//! Local load balancing strategies

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Strategy used to pick one instance out of a healthy set
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Shared counter modulo instance count
    #[default]
    RoundRobin,
    /// Minimum load score, first encountered wins ties
    LeastLoaded,
    /// Uniform random choice
    Random,
}

/// Returned when a strategy name is not recognised
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported load balance strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl LoadBalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::RoundRobin => "round_robin",
            LoadBalanceStrategy::LeastLoaded => "least_loaded",
            LoadBalanceStrategy::Random => "random",
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "round-robin" => Ok(LoadBalanceStrategy::RoundRobin),
            "least_loaded" | "least-loaded" => Ok(LoadBalanceStrategy::LeastLoaded),
            "random" => Ok(LoadBalanceStrategy::Random),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strategies() {
        assert_eq!("round_robin".parse(), Ok(LoadBalanceStrategy::RoundRobin));
        assert_eq!("Least-Loaded".parse(), Ok(LoadBalanceStrategy::LeastLoaded));
        assert_eq!("random".parse(), Ok(LoadBalanceStrategy::Random));
    }

    #[test]
    fn test_parse_unknown_strategy() {
        let err = "weighted".parse::<LoadBalanceStrategy>().unwrap_err();
        assert_eq!(err, UnknownStrategy("weighted".to_string()));
    }
}
