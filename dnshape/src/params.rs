//! Validation of caller-supplied shaping parameters.

use crate::{
    error::{Error, Result},
    types::{LossRate, ShapingParams},
};

/// Shaping parameters as supplied by a caller, before validation.
///
/// An empty field means the parameter is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawParams {
    /// `unlimited` or bits per second.
    pub bandwidth: String,
    /// Milliseconds.
    pub delay: String,
    /// Decimal probability in `[0, 1]`.
    pub loss: String,
}

impl RawParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bandwidth(mut self, bandwidth: impl Into<String>) -> Self {
        self.bandwidth = bandwidth.into();
        self
    }

    pub fn delay(mut self, delay: impl Into<String>) -> Self {
        self.delay = delay.into();
        self
    }

    pub fn loss(mut self, loss: impl Into<String>) -> Self {
        self.loss = loss.into();
        self
    }

    /// Validates every field. The result is normalized: zero values become absent.
    pub fn parse(&self) -> Result<ShapingParams> {
        Ok(ShapingParams {
            bandwidth: parse_bandwidth(&self.bandwidth)?,
            delay: parse_delay(&self.delay)?,
            loss: parse_loss(&self.loss)?,
        }
        .normalized())
    }
}

/// Accepts an unsigned decimal integer, without sign or whitespace.
fn parse_unsigned(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

pub fn parse_bandwidth(s: &str) -> Result<Option<u64>> {
    let s = s.trim();
    if s.is_empty() || s == "unlimited" {
        return Ok(None);
    }

    parse_unsigned(s).map(Some).ok_or_else(|| Error::InvalidBandwidth(s.to_owned()))
}

pub fn parse_delay(s: &str) -> Result<Option<u64>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }

    parse_unsigned(s).map(Some).ok_or_else(|| Error::InvalidDelay(s.to_owned()))
}

pub fn parse_loss(s: &str) -> Result<Option<LossRate>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }

    s.parse().map(Some).map_err(|_| Error::InvalidLossRate(s.to_owned()))
}
