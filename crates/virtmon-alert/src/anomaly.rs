use virtmon_common::types::Guest;

const MB: f64 = 1024.0 * 1024.0;

/// Combined traffic below this is considered idle and never anomalous.
const IDLE_FLOOR_BYTES_PER_SEC: f64 = MB;

/// Asymmetry is only suspicious when the louder direction is itself loud.
const ASYMMETRY_RATIO: f64 = 50.0;
const ASYMMETRY_PEAK_BYTES_PER_SEC: f64 = 50.0 * MB;

/// Guests whose names suggest legitimately heavy transfer get a raised
/// suspicion threshold instead of tripping on every backup window.
const HIGH_BANDWIDTH_MARKERS: &[&str] = &[
    "backup", "bak", "repl", "mirror", "sync", "nas", "media", "plex", "jellyfin", "seed",
    "torrent", "download",
];

/// Why a guest's traffic was flagged.
#[derive(Debug, Clone, PartialEq)]
pub enum AnomalyReason {
    /// Combined volume exceeded the (possibly raised) threshold.
    Volume { threshold: f64 },
    /// One direction dwarfs the other with a loud peak (exfiltration shape).
    Asymmetry { ratio: f64 },
}

#[derive(Debug, Clone)]
pub struct NetworkAnomaly {
    pub combined_rate: f64,
    pub reason: AnomalyReason,
}

/// Detector for the `network_combined` pseudo-metric. This is deliberately
/// separate from the generic condition dispatcher, where `anomaly` never
/// matches.
pub struct NetworkAnomalyDetector {
    /// Base combined-volume threshold in bytes/s.
    volume_threshold: f64,
    /// Multiplier applied for known high-bandwidth guests.
    high_bandwidth_factor: f64,
}

impl Default for NetworkAnomalyDetector {
    fn default() -> Self {
        Self {
            volume_threshold: 100.0 * MB,
            high_bandwidth_factor: 4.0,
        }
    }
}

impl NetworkAnomalyDetector {
    pub fn new(volume_threshold: f64, high_bandwidth_factor: f64) -> Self {
        Self {
            volume_threshold,
            high_bandwidth_factor,
        }
    }

    /// Evaluate derived network rates (bytes/s) for one guest. Returns
    /// `None` when rates are unavailable, the guest is near idle, or the
    /// traffic looks ordinary.
    pub fn evaluate(
        &self,
        guest: &Guest,
        netin_rate: Option<f64>,
        netout_rate: Option<f64>,
    ) -> Option<NetworkAnomaly> {
        let inbound = netin_rate.filter(|r| r.is_finite())?;
        let outbound = netout_rate.filter(|r| r.is_finite())?;
        let combined = inbound + outbound;

        if combined < IDLE_FLOOR_BYTES_PER_SEC {
            return None;
        }

        let threshold = if is_high_bandwidth_guest(guest) {
            self.volume_threshold * self.high_bandwidth_factor
        } else {
            self.volume_threshold
        };

        if combined > threshold {
            return Some(NetworkAnomaly {
                combined_rate: combined,
                reason: AnomalyReason::Volume { threshold },
            });
        }

        let peak = inbound.max(outbound);
        let floor = inbound.min(outbound).max(1.0);
        let ratio = peak / floor;
        if ratio > ASYMMETRY_RATIO && peak > ASYMMETRY_PEAK_BYTES_PER_SEC {
            return Some(NetworkAnomaly {
                combined_rate: combined,
                reason: AnomalyReason::Asymmetry { ratio },
            });
        }

        None
    }
}

fn is_high_bandwidth_guest(guest: &Guest) -> bool {
    let name = guest.name.to_lowercase();
    HIGH_BANDWIDTH_MARKERS.iter().any(|m| name.contains(m))
}
