use std::{
    fmt::{self, Display},
    net::IpAddr,
    str::FromStr,
};

use pnet::datalink::MacAddr;

use crate::error::Error;

/// Identifier of an ipfw rule.
pub type RuleId = u32;

/// Identifier of a dummynet pipe.
pub type QueueId = u32;

/// The direction of traffic, relative to the shaped address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Traffic arriving, destined to the address.
    Inbound,
    /// Traffic leaving from the address.
    Outbound,
}

impl Direction {
    /// The ipfw keyword for this direction.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "in",
            Self::Outbound => "out",
        }
    }

    /// Returns the `(from, to)` match fields for a rule shaping `address` in this direction.
    pub fn endpoints(self, address: &AddressSpec) -> (AddressSpec, AddressSpec) {
        match self {
            Self::Outbound => (*address, AddressSpec::Any),
            Self::Inbound => (AddressSpec::Any, *address),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::Inbound),
            "out" => Ok(Self::Outbound),
            other => Err(Error::ProtocolViolation(other.to_owned())),
        }
    }
}

/// The address a rule matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpec {
    /// Matches all traffic.
    Any,
    /// An IPv4 or IPv6 host, matched at layer 3.
    Ip(IpAddr),
    /// An Ethernet address, matched at layer 2.
    Hardware(MacAddr),
}

impl AddressSpec {
    /// Returns true for the wildcard.
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Returns true if rules on this address match at layer 2.
    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Hardware(_))
    }
}

impl Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::Ip(ip) => write!(f, "{ip}"),
            Self::Hardware(mac) => write!(f, "{mac}"),
        }
    }
}

/// Parses user input. The empty string and `any` both mean [`AddressSpec::Any`].
impl FromStr for AddressSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("any") {
            return Ok(Self::Any);
        }

        if let Ok(ip) = s.parse::<IpAddr>() {
            if ip.is_unspecified() {
                return Err(Error::InvalidAddress(s.to_owned()));
            }
            return Ok(Self::Ip(ip));
        }

        s.parse::<MacAddr>().map(Self::Hardware).map_err(|_| Error::InvalidAddress(s.to_owned()))
    }
}

/// Error returned when a loss rate is not a plain decimal in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a decimal between 0 and 1: {0:?}")]
pub struct ParseLossRateError(pub String);

/// A packet loss probability in `[0, 1]`.
///
/// dummynet echoes the rate back zero-padded (`0.000100`), so equality is defined on the
/// canonical decimal text rather than on the floating point value.
#[derive(Debug, Clone)]
pub struct LossRate {
    value: f64,
    canonical: String,
}

impl LossRate {
    /// The probability as a float.
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0.0
    }
}

impl PartialEq for LossRate {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for LossRate {}

impl Display for LossRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for LossRate {
    type Err = ParseLossRateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseLossRateError(s.to_owned());

        let (int, frac) = s.split_once('.').unwrap_or((s, ""));
        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (int.is_empty() && frac.is_empty()) || !all_digits(int) || !all_digits(frac) {
            return Err(err());
        }

        let int = match int.trim_start_matches('0') {
            "" => "0",
            int => int,
        };
        let frac = frac.trim_end_matches('0');
        let canonical = if frac.is_empty() { int.to_owned() } else { format!("{int}.{frac}") };

        let value: f64 = canonical.parse().map_err(|_| err())?;
        if value > 1.0 {
            return Err(err());
        }

        Ok(Self { value, canonical })
    }
}

/// Desired (or observed) shaping parameters for one direction.
///
/// Absent and zero are equivalent. A value with every field absent means "no shaping".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapingParams {
    /// Bandwidth cap in bits per second.
    pub bandwidth: Option<u64>,
    /// Added delay in milliseconds.
    pub delay: Option<u64>,
    pub loss: Option<LossRate>,
}

impl ShapingParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bandwidth(mut self, bits_per_second: u64) -> Self {
        self.bandwidth = Some(bits_per_second);
        self
    }

    pub fn delay(mut self, millis: u64) -> Self {
        self.delay = Some(millis);
        self
    }

    pub fn loss(mut self, loss: LossRate) -> Self {
        self.loss = Some(loss);
        self
    }

    /// Folds zero values into absent ones.
    pub fn normalized(self) -> Self {
        Self {
            bandwidth: self.bandwidth.filter(|&bw| bw != 0),
            delay: self.delay.filter(|&delay| delay != 0),
            loss: self.loss.filter(|loss| !loss.is_zero()),
        }
    }

    pub fn is_unshaped(&self) -> bool {
        self.clone().normalized() == Self::default()
    }
}

impl Display for ShapingParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self.clone().normalized();
        if params == Self::default() {
            return f.write_str("unshaped");
        }

        let mut parts = Vec::with_capacity(3);
        if let Some(bw) = params.bandwidth {
            parts.push(format!("bandwidth={bw}bit/s"));
        }
        if let Some(delay) = params.delay {
            parts.push(format!("delay={delay}ms"));
        }
        if let Some(loss) = params.loss {
            parts.push(format!("loss={loss}"));
        }

        f.write_str(&parts.join(" "))
    }
}

/// An ipfw rule sending matched traffic into a dummynet pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRule {
    pub rule_id: RuleId,
    pub queue_id: QueueId,
    pub direction: Direction,
    pub from: AddressSpec,
    pub to: AddressSpec,
}

/// The parameters of a dummynet pipe, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub queue_id: QueueId,
    /// `None` when the pipe reports `unlimited`.
    pub bandwidth: Option<u64>,
    pub delay: u64,
    pub loss: Option<LossRate>,
}

impl QueueConfig {
    pub fn params(&self) -> ShapingParams {
        ShapingParams { bandwidth: self.bandwidth, delay: Some(self.delay), loss: self.loss.clone() }
            .normalized()
    }
}

/// The current backend state for one `(address, direction)` pair.
///
/// May be stale as soon as it has been read: nothing locks the backend in between.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub rule: Option<ClassificationRule>,
    pub queue: Option<QueueConfig>,
}

impl Snapshot {
    pub fn is_absent(&self) -> bool {
        self.rule.is_none() && self.queue.is_none()
    }

    /// The shaping currently in effect. Unshaped if there is no queue.
    pub fn params(&self) -> ShapingParams {
        self.queue.as_ref().map(QueueConfig::params).unwrap_or_default()
    }
}

/// Both directions of one address, as returned by `get`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    /// Traffic towards the address.
    pub down: Snapshot,
    /// Traffic from the address.
    pub up: Snapshot,
}

impl Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "down: {}", self.down.params())?;
        write!(f, "up: {}", self.up.params())
    }
}
