//! Link shaping through the Linux `netem` qdisc.
//!
//! A [`LinkShaping`] describes how a link is degraded. [`Netem`] turns it into the `tc` command
//! that installs the matching qdisc on one interface.

use std::time::Duration;

use crate::{command::Cmd, error::ValidationError};

/// Largest rate cap `tc` accepts for `netem`, in Kbit/s.
pub const MAX_RATE_KBIT: u64 = u32::MAX as u64;

/// Shaping parameters applied to both interfaces of a link.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use topolab_sim::netem::LinkShaping;
///
/// // A lossy, slow backbone.
/// let shaping = LinkShaping {
///     loss: 5.0,
///     delay: Some(Duration::from_millis(20)),
///     bandwidth_mbit_s: Some(10.0),
/// };
/// assert!(shaping.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkShaping {
    /// Packet loss percentage (0.0 to 100.0).
    pub loss: f64,
    /// Delay added to every packet leaving the interface.
    pub delay: Option<Duration>,
    /// Bandwidth cap in megabits per second.
    pub bandwidth_mbit_s: Option<f64>,
}

impl LinkShaping {
    /// Shaping with only a loss percentage.
    pub fn with_loss(loss: f64) -> Self {
        Self { loss, ..Default::default() }
    }

    /// Checks the parameters are in range before anything is applied.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.loss.is_finite() || !(0.0..=100.0).contains(&self.loss) {
            return Err(ValidationError::InvalidParameter {
                name: "loss",
                reason: format!("{} is not a percentage between 0 and 100", self.loss),
            });
        }

        if let Some(bandwidth) = self.bandwidth_mbit_s {
            if !bandwidth.is_finite() || bandwidth <= 0.0 {
                return Err(ValidationError::InvalidParameter {
                    name: "bandwidth",
                    reason: format!("{bandwidth} Mbit/s must be a positive number"),
                });
            }

            let kbit = (bandwidth * 1000.0).round();
            if !(1.0..=MAX_RATE_KBIT as f64).contains(&kbit) {
                return Err(ValidationError::InvalidParameter {
                    name: "bandwidth",
                    reason: format!("{bandwidth} Mbit/s is outside 1 Kbit/s to {MAX_RATE_KBIT} Kbit/s"),
                });
            }
        }

        Ok(())
    }

    /// The bandwidth cap in whole Kbit/s, as handed to `tc`. Only meaningful after
    /// [`validate`](Self::validate) succeeded.
    pub fn rate_kbit(&self) -> Option<u64> {
        self.bandwidth_mbit_s.map(|bandwidth| ((bandwidth * 1000.0).round() as u64).clamp(1, MAX_RATE_KBIT))
    }

    /// Returns `true` if applying this shaping would leave the link untouched.
    pub fn is_unimpaired(&self) -> bool {
        self.loss == 0.0 &&
            self.delay.map_or(true, |d| d.is_zero()) &&
            self.bandwidth_mbit_s.is_none()
    }
}

/// Builder for the `tc` commands managing the root `netem` qdisc of a device.
#[derive(Debug, Clone)]
pub struct Netem {
    device: String,
    /// Optional delay in microseconds.
    delay_us: Option<u128>,
    /// Optional packet loss rate in percent.
    loss: Option<f64>,
    /// Optional rate cap in Kbit/s.
    rate_kbit: Option<u64>,
}

impl Netem {
    pub fn new(device: impl Into<String>) -> Self {
        Self { device: device.into(), delay_us: None, loss: None, rate_kbit: None }
    }

    /// Creates a builder carrying every non-default parameter of `shaping`.
    pub fn from_shaping(device: impl Into<String>, shaping: &LinkShaping) -> Self {
        let mut netem = Self::new(device);

        if let Some(delay) = shaping.delay.filter(|d| !d.is_zero()) {
            netem = netem.delay(delay);
        }
        if shaping.loss > 0.0 {
            netem = netem.loss(shaping.loss);
        }
        if let Some(rate) = shaping.rate_kbit() {
            netem = netem.rate_kbit(rate);
        }

        netem
    }

    /// Set the delay added to every packet.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_us = Some(delay.as_micros());
        self
    }

    /// Set the packet loss rate in percent.
    pub fn loss(mut self, loss: f64) -> Self {
        self.loss = Some(loss);
        self
    }

    /// Set the rate cap in Kbit/s.
    pub fn rate_kbit(mut self, rate: u64) -> Self {
        self.rate_kbit = Some(rate);
        self
    }

    /// Builds the command installing (or replacing) the qdisc.
    pub fn build(&self) -> Cmd {
        let mut argv: Vec<String> = ["tc", "qdisc", "replace", "dev", &self.device, "root", "netem"]
            .into_iter()
            .map(str::to_string)
            .collect();

        if let Some(delay) = self.delay_us {
            argv.extend(["delay".to_string(), format!("{delay}us")]);
        }

        if let Some(loss) = self.loss {
            argv.extend(["loss".to_string(), format!("{loss}%")]);
        }

        if let Some(rate) = self.rate_kbit {
            argv.extend(["rate".to_string(), format!("{rate}kbit")]);
        }

        Cmd::new(argv)
    }

    /// Builds the command removing the root qdisc of `device`.
    pub fn clear(device: &str) -> Cmd {
        Cmd::new(["tc", "qdisc", "del", "dev", device, "root"])
    }
}
