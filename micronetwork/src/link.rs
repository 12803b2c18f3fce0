//! Decide when (and whether) a packet sent over a link arrives.

use crate::{node::Packet, topology::Link, ConfigError};
use rand::Rng;
use rand_distr::{Distribution, Exp1, Normal};
use std::{fmt, time::Duration};

/// Smallest delay between sending and delivering a packet.
///
/// Sampled latencies are clamped to this value so that a packet never arrives
/// at the same simulated time it was sent.
pub const MIN_LATENCY: Duration = Duration::from_nanos(1);

/// Distribution of the propagation delay of a link.
#[derive(Clone, Debug, PartialEq)]
pub enum Latency {
    /// Every packet takes exactly this long.
    Fixed(Duration),

    /// Uniformly distributed in `[low, high]`.
    Uniform { low: Duration, high: Duration },

    /// Exponentially distributed with the given mean.
    Exponential { mean: Duration },

    /// Normally distributed (negative samples are clamped).
    Normal { mean: Duration, stddev: Duration },
}

impl Latency {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Latency::Uniform { low, high } if low > high => {
                Err(ConfigError::InvalidLatency("uniform range is empty"))
            }
            Latency::Exponential { mean } if mean.is_zero() => {
                Err(ConfigError::InvalidLatency("exponential mean must be non-zero"))
            }
            _ => Ok(()),
        }
    }

    /// Draw a delay from the distribution.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let delay = match self {
            Latency::Fixed(delay) => *delay,
            Latency::Uniform { low, high } => rng.gen_range(*low..=*high),
            Latency::Exponential { mean } => {
                let draw: f64 = Exp1.sample(rng);
                from_secs(draw * mean.as_secs_f64())
            }
            Latency::Normal { mean, stddev } => {
                match Normal::new(mean.as_secs_f64(), stddev.as_secs_f64()) {
                    Ok(normal) => from_secs(normal.sample(rng)),
                    Err(_) => *mean,
                }
            }
        };
        delay.max(MIN_LATENCY)
    }
}

/// Convert a (possibly negative or huge) number of seconds into a delay.
fn from_secs(secs: f64) -> Duration {
    if secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Why a packet never reached its destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The link was partitioned when the packet was sent.
    Partitioned,
    /// The packet was randomly lost.
    Lost,
    /// There is no link from the sender to the recipient.
    NoLink,
    /// The recipient's handler stopped responding.
    Stalled,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Partitioned => "partitioned",
            DropReason::Lost => "lost",
            DropReason::NoLink => "no link",
            DropReason::Stalled => "stalled",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of sending a packet over a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Deliver the packet at the given simulated time (always after `now`).
    Deliver(Duration),
    /// Never deliver the packet.
    Drop(DropReason),
}

/// Time the link spends putting `len` bytes on the wire.
fn transmission(len: usize, bytes_per_second: u64) -> Duration {
    let nanos = (len as u128 * 1_000_000_000).div_ceil(bytes_per_second as u128);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Apply link settings to a packet sent at `now`.
///
/// Partitioned links drop without consuming randomness. Otherwise the packet first waits for
/// earlier transmissions on the link to finish (if the link is bandwidth limited), then a
/// latency and a loss decision are drawn, in that order. Lost packets still occupy the link
/// because the sender transmitted them.
pub fn resolve<R: Rng + ?Sized>(
    link: &mut Link,
    packet: &Packet,
    now: Duration,
    rng: &mut R,
) -> Decision {
    if link.is_partitioned() {
        return Decision::Drop(DropReason::Partitioned);
    }

    // Wait for the link to be available
    let departure = match link.config().bandwidth {
        Some(bandwidth) => {
            let start = link.busy_until.max(now);
            let end = start.saturating_add(transmission(packet.payload.len(), bandwidth.get()));
            link.busy_until = end;
            end
        }
        None => now,
    };

    // Apply link settings
    let latency = link.config().latency.sample(rng);
    let loss = link.config().loss;
    if rng.gen_bool(loss) {
        return Decision::Drop(DropReason::Lost);
    }
    Decision::Deliver(departure.saturating_add(latency))
}
