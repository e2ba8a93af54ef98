//! Argument builders for `ipfw` rules and dummynet pipes.

use std::net::Ipv4Addr;

use crate::types::{AddressSpec, Direction, LossRate, QueueId, RuleId, ShapingParams};

/// Pipe represents a dummynet pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipe {
    /// The ID of the pipe.
    pub id: QueueId,
    /// Optional bandwidth cap in bits per second.
    pub bandwidth: Option<u64>,
    /// Optional propagation delay in ms.
    pub delay: Option<u64>,
    /// Optional packet loss rate, as a probability.
    pub plr: Option<LossRate>,
}

impl Pipe {
    /// Creates a new pipe with the given ID. The ID must be unique.
    pub fn new(id: QueueId) -> Self {
        Self { id, bandwidth: None, delay: None, plr: None }
    }

    /// Creates a pipe configured with the present fields of `params`.
    pub fn with_params(id: QueueId, params: &ShapingParams) -> Self {
        Self { id, bandwidth: params.bandwidth, delay: params.delay, plr: params.loss.clone() }
    }

    /// Set the bandwidth cap of the pipe in bits per second.
    pub fn bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    /// Set the propagation delay of the pipe in ms.
    pub fn delay(mut self, delay: u64) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set the packet loss rate of the pipe.
    pub fn plr(mut self, plr: LossRate) -> Self {
        self.plr = Some(plr);
        self
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Builds the arguments to create or reconfigure the pipe. Unset fields are left out, which
    /// leaves them to the backend.
    pub fn config_args(&self) -> Vec<String> {
        let mut args = vec!["pipe".to_owned(), self.id.to_string(), "config".to_owned()];

        if let Some(bandwidth) = self.bandwidth {
            args.extend(["bw".to_owned(), format!("{bandwidth}bit/s")]);
        }

        if let Some(delay) = self.delay {
            args.extend(["delay".to_owned(), delay.to_string()]);
        }

        if let Some(plr) = &self.plr {
            args.extend(["plr".to_owned(), plr.to_string()]);
        }

        args
    }

    /// Builds the arguments to show the pipe.
    pub fn show_args(id: QueueId) -> Vec<String> {
        vec!["pipe".to_owned(), id.to_string(), "show".to_owned()]
    }

    /// Builds the arguments to destroy the pipe.
    pub fn destroy_args(id: QueueId) -> Vec<String> {
        vec!["pipe".to_owned(), "delete".to_owned(), id.to_string()]
    }
}

/// What a rule does with matching packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Send matching packets through a dummynet pipe.
    Pipe(QueueId),
    /// Only count matching packets.
    Count,
}

/// An `ipfw add` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    /// Explicit rule number. `None` lets ipfw pick one.
    pub id: Option<RuleId>,
    pub action: RuleAction,
    pub from: AddressSpec,
    pub to: AddressSpec,
    pub direction: Option<Direction>,
}

impl RuleSpec {
    /// A rule sending traffic from `from` to `to` through `queue`.
    pub fn pipe(queue: QueueId, from: AddressSpec, to: AddressSpec, direction: Direction) -> Self {
        Self { id: None, action: RuleAction::Pipe(queue), from, to, direction: Some(direction) }
    }

    /// A counting rule matching `address` against itself, which no real traffic does.
    pub fn placeholder(address: Ipv4Addr) -> Self {
        let address = AddressSpec::Ip(address.into());
        Self { id: None, action: RuleAction::Count, from: address, to: address, direction: None }
    }

    pub fn with_id(mut self, id: RuleId) -> Self {
        self.id = Some(id);
        self
    }

    /// Builds the arguments to add the rule.
    pub fn add_args(&self) -> Vec<String> {
        let mut args = vec!["add".to_owned()];

        if let Some(id) = self.id {
            args.push(id.to_string());
        }

        match self.action {
            RuleAction::Pipe(queue) => args.extend(["pipe".to_owned(), queue.to_string()]),
            RuleAction::Count => args.push("count".to_owned()),
        }

        if self.from.is_hardware() || self.to.is_hardware() {
            // Layer 2 matches take the destination first.
            args.extend(["MAC".to_owned(), self.to.to_string(), self.from.to_string()]);
        } else {
            args.extend([
                "ip".to_owned(),
                "from".to_owned(),
                self.from.to_string(),
                "to".to_owned(),
                self.to.to_string(),
            ]);
        }

        if let Some(direction) = self.direction {
            args.push(direction.as_str().to_owned());
        }

        args
    }

    /// Builds the arguments to delete every rule numbered `id`.
    pub fn delete_args(id: RuleId) -> Vec<String> {
        vec!["delete".to_owned(), id.to_string()]
    }
}
