//! Per-service circuit breakers
//!
//! A breaker counts consecutive failures. Reaching the threshold opens it
//! for a cooldown; the first route attempt after the cooldown becomes the
//! single half-open probe, whose outcome closes or re-opens the breaker.
//!
//! Every report is applied while holding the service's map entry, so each
//! one is a single compare-and-transition. Breaker state is local to this
//! process and is not shared through the registry store.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use mesh_api::{CircuitBreakerState, CircuitState};
use mesh_core::{Clock, MeshConfig, MeshError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Circuit breaker configuration
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::seconds(60),
        }
    }
}

impl From<&MeshConfig> for BreakerConfig {
    fn from(config: &MeshConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_threshold,
            cooldown: config.circuit_breaker_cooldown(),
        }
    }
}

/// Permission to route, granted by [`CircuitBreakerRegistry::acquire`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permit {
    /// Circuit closed, route normally
    Allowed,
    /// This request is the half-open trial
    Probe,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitBreakerState,
    probe_started: Option<DateTime<Utc>>,
}

/// Owns one breaker per service, created on the first reported failure
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Breaker>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Check whether a route attempt may proceed
    ///
    /// Returns `CircuitOpen` while the breaker is open, or while another
    /// caller holds the half-open probe.
    pub fn acquire(&self, service: &str) -> Result<Permit> {
        let now = self.clock.now();
        let mut breaker = match self.breakers.get_mut(service) {
            Some(breaker) => breaker,
            None => return Ok(Permit::Allowed),
        };

        let state = breaker.state.state;
        let probe_started = breaker.probe_started;
        match state {
            CircuitState::Closed => Ok(Permit::Allowed),
            CircuitState::Open => {
                let retry_at = breaker.state.next_retry_time.unwrap_or(now);
                if now >= retry_at {
                    info!("Circuit breaker for {}: half-open, granting probe", service);
                    breaker.state.state = CircuitState::HalfOpen;
                    breaker.probe_started = Some(now);
                    Ok(Permit::Probe)
                } else {
                    Err(MeshError::CircuitOpen(service.to_string()))
                }
            }
            CircuitState::HalfOpen => match probe_started {
                Some(started) if now < started + self.config.cooldown => {
                    Err(MeshError::CircuitOpen(service.to_string()))
                }
                _ => {
                    // The previous probe never reported back, or was released
                    debug!("Circuit breaker for {}: re-granting probe", service);
                    breaker.probe_started = Some(now);
                    Ok(Permit::Probe)
                }
            },
        }
    }

    /// Return an unused probe slot, e.g. when no instance could be selected
    pub fn release_probe(&self, service: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(service) {
            if breaker.state.state == CircuitState::HalfOpen {
                breaker.probe_started = None;
            }
        }
    }

    /// Record a successful request
    ///
    /// Returns the new state if this report caused a transition.
    pub fn record_success(&self, service: &str) -> Option<CircuitState> {
        let mut breaker = self.breakers.get_mut(service)?;
        let state = breaker.state.state;
        match state {
            CircuitState::Closed => {
                breaker.state.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                info!("Circuit breaker for {}: probe succeeded, closing", service);
                breaker.state.state = CircuitState::Closed;
                breaker.state.failure_count = 0;
                breaker.state.next_retry_time = None;
                breaker.probe_started = None;
                Some(CircuitState::Closed)
            }
            // A late report from a request issued before the circuit opened
            CircuitState::Open => None,
        }
    }

    /// Record a failed request
    ///
    /// Returns the new state if this report caused a transition.
    pub fn record_failure(&self, service: &str) -> Option<CircuitState> {
        let now = self.clock.now();
        let mut breaker = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(|| Breaker {
                state: CircuitBreakerState::new(service),
                probe_started: None,
            });

        breaker.state.failure_count = breaker.state.failure_count.saturating_add(1);
        breaker.state.last_failure_time = Some(now);

        let state = breaker.state.state;
        match state {
            CircuitState::Closed => {
                if breaker.state.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker for {}: opening after {} consecutive failures",
                        service, breaker.state.failure_count
                    );
                    breaker.state.state = CircuitState::Open;
                    breaker.state.next_retry_time = Some(now + self.config.cooldown);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker for {}: probe failed, re-opening", service);
                breaker.state.state = CircuitState::Open;
                breaker.state.next_retry_time = Some(now + self.config.cooldown);
                breaker.probe_started = None;
                Some(CircuitState::Open)
            }
            // Already open: the cooldown is not extended
            CircuitState::Open => None,
        }
    }

    /// Effective state, reporting an elapsed open circuit as half-open
    pub fn state(&self, service: &str) -> CircuitState {
        let now = self.clock.now();
        match self.breakers.get(service) {
            Some(breaker) => match breaker.state.state {
                CircuitState::Open
                    if breaker
                        .state
                        .next_retry_time
                        .map(|at| now >= at)
                        .unwrap_or(true) =>
                {
                    CircuitState::HalfOpen
                }
                state => state,
            },
            None => CircuitState::Closed,
        }
    }

    pub fn snapshot(&self, service: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(service).map(|b| b.state.clone())
    }

    /// Snapshot of every breaker, sorted by service name
    pub fn all(&self) -> Vec<CircuitBreakerState> {
        let mut states: Vec<CircuitBreakerState> =
            self.breakers.iter().map(|b| b.state.clone()).collect();
        states.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        states
    }

    /// Forget a service's breaker entirely
    pub fn reset(&self, service: &str) -> bool {
        self.breakers.remove(service).is_some()
    }
}
