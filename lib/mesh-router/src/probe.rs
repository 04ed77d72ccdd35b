//! Inter-region latency probes

use crate::geo::haversine_km;
use async_trait::async_trait;
use mesh_api::Region;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, warn};

/// Measures round-trip latency from one region to another
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Latency in milliseconds, or `None` when it could not be measured
    async fn measure(&self, from: &Region, to: &Region) -> Option<f64>;
}

/// Times a TCP handshake against the target region's probe endpoint
///
/// The probe runs from wherever this process is deployed, so `from` only
/// labels the sample.
pub struct TcpLatencyProbe {
    timeout: Duration,
}

impl TcpLatencyProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpLatencyProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl LatencyProbe for TcpLatencyProbe {
    async fn measure(&self, from: &Region, to: &Region) -> Option<f64> {
        let endpoint = to.probe_endpoint.as_deref()?;
        let started = Instant::now();

        match time::timeout(self.timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(_)) => {
                let ms = started.elapsed().as_secs_f64() * 1000.0;
                debug!("Probe {} -> {} ({}): {:.1}ms", from.region_id, to.region_id, endpoint, ms);
                Some(ms)
            }
            Ok(Err(e)) => {
                warn!("Probe {} -> {} ({}) failed: {}", from.region_id, to.region_id, endpoint, e);
                None
            }
            Err(_) => {
                warn!("Probe {} -> {} ({}) timed out", from.region_id, to.region_id, endpoint);
                None
            }
        }
    }
}

/// Synthetic latency derived from distance plus a slow wave and jitter
pub struct SimulatedLatencyProbe {
    started: Instant,
    wave_amplitude_ms: f64,
    jitter_ms: f64,
}

impl SimulatedLatencyProbe {
    /// Light in fibre covers roughly 100km per millisecond of round trip
    const KM_PER_MS: f64 = 100.0;
    const BASE_MS: f64 = 5.0;
    /// Used when either region has no coordinates
    const UNKNOWN_DISTANCE_MS: f64 = 150.0;
    const WAVE_PERIOD_SECS: f64 = 300.0;

    pub fn new(wave_amplitude_ms: f64, jitter_ms: f64) -> Self {
        Self {
            started: Instant::now(),
            wave_amplitude_ms,
            jitter_ms,
        }
    }

    /// Distance-only latency, fully deterministic
    pub fn steady() -> Self {
        Self::new(0.0, 0.0)
    }

    fn base_latency(from: &Region, to: &Region) -> f64 {
        match (from.coordinates, to.coordinates) {
            (Some(a), Some(b)) => Self::BASE_MS + haversine_km(a, b) / Self::KM_PER_MS,
            _ => Self::UNKNOWN_DISTANCE_MS,
        }
    }
}

impl Default for SimulatedLatencyProbe {
    fn default() -> Self {
        Self::new(10.0, 5.0)
    }
}

#[async_trait]
impl LatencyProbe for SimulatedLatencyProbe {
    async fn measure(&self, from: &Region, to: &Region) -> Option<f64> {
        let phase = self.started.elapsed().as_secs_f64() / Self::WAVE_PERIOD_SECS
            * std::f64::consts::TAU;
        let wave = self.wave_amplitude_ms * phase.sin();
        let jitter = if self.jitter_ms > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter_ms)
        } else {
            0.0
        };
        Some((Self::base_latency(from, to) + wave + jitter).max(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_api::Coordinates;
    use tokio::net::TcpListener;

    fn region(id: &str, coords: Option<Coordinates>) -> Region {
        Region::new(id, id, "XX", coords)
    }

    #[tokio::test]
    async fn test_steady_probe_follows_distance() {
        let probe = SimulatedLatencyProbe::steady();
        let ny = region("us-east-1", Some(Coordinates::new(40.7128, -74.0060)));
        let london = region("eu-west-1", Some(Coordinates::new(51.5074, -0.1278)));
        let boston = region("us-east-2", Some(Coordinates::new(42.3601, -71.0589)));

        let far = probe.measure(&ny, &london).await.unwrap();
        let near = probe.measure(&ny, &boston).await.unwrap();
        assert!((far - 60.7).abs() < 1.0, "far {}", far);
        assert!(near < far);
    }

    #[tokio::test]
    async fn test_simulated_probe_unknown_coordinates() {
        let probe = SimulatedLatencyProbe::steady();
        let a = region("a", None);
        let b = region("b", Some(Coordinates::new(0.0, 0.0)));
        assert_eq!(probe.measure(&a, &b).await, Some(150.0));
    }

    #[tokio::test]
    async fn test_jitter_stays_bounded() {
        let probe = SimulatedLatencyProbe::new(10.0, 5.0);
        let a = region("a", Some(Coordinates::new(0.0, 0.0)));
        for _ in 0..20 {
            let ms = probe.measure(&a, &a).await.unwrap();
            assert!((1.0..=20.0).contains(&ms), "ms {}", ms);
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_without_endpoint() {
        let probe = TcpLatencyProbe::default();
        let a = region("a", None);
        assert_eq!(probe.measure(&a, &a).await, None);
    }

    #[tokio::test]
    async fn test_tcp_probe_measures_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let probe = TcpLatencyProbe::default();
        let from = region("a", None);
        let to = region("b", None).with_probe_endpoint(addr.to_string());
        let ms = probe.measure(&from, &to).await.unwrap();
        assert!(ms >= 0.0);
    }
}
