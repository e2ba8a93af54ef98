//! Brings the backend in line with the desired shaping of an address.
//!
//! Every `(address, direction)` pair is shaped by at most one ipfw rule sending its traffic into
//! one dummynet pipe. The pair moves between two states:
//!
//! ```text
//! Absent --create--> Configured --update--> Configured --delete--> Absent
//! ```
//!
//! Each [`Reconciler::apply`] reads the current state, then issues only the mutations needed to
//! reach the desired one. Nothing locks the backend between the read and the writes, so callers
//! must not run concurrent invocations against the same host. Failed mutations are not rolled
//! back; applying the same parameters again repairs whatever was left behind, including
//! identifiers reserved for a rule that was never created.

use std::collections::HashSet;

use crate::{
    allocator::{IdentifierAllocator, PlaceholderAllocator, RuleNumbers},
    backend::{Ipfw, ShaperBackend},
    config::{Config, RuleConfig},
    error::{Error, Result},
    params::RawParams,
    parser,
    pipe::{Pipe, RuleSpec},
    state::StateReader,
    types::{
        AddressSpec, ClassificationRule, Direction, LinkState, QueueId, RuleId, ShapingParams, Snapshot,
    },
};

#[derive(Debug, Clone)]
pub struct Reconciler<B, A = PlaceholderAllocator> {
    backend: B,
    allocator: A,
    rules: RuleConfig,
}

impl Reconciler<Ipfw> {
    /// Creates a reconciler driving the `ipfw` binary described by `config`.
    pub fn from_config(config: Config) -> Self {
        Self::new(Ipfw::new(config.ipfw), config.rules)
    }
}

impl<B: ShaperBackend> Reconciler<B> {
    pub fn new(backend: B, rules: RuleConfig) -> Self {
        Self::with_allocator(backend, PlaceholderAllocator::new(rules), rules)
    }
}

impl<B: ShaperBackend, A: IdentifierAllocator> Reconciler<B, A> {
    pub fn with_allocator(backend: B, allocator: A, rules: RuleConfig) -> Self {
        Self { backend, allocator, rules }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Validates an address and its shaping parameters without contacting the backend.
    pub fn validate(
        &self,
        address: &str,
        desired: &RawParams,
    ) -> Result<(AddressSpec, ShapingParams)> {
        Ok((self.parse_address(address)?, desired.parse()?))
    }

    /// Parses an address, rejecting the one reserved for placeholder rules.
    fn parse_address(&self, address: &str) -> Result<AddressSpec> {
        let spec: AddressSpec = address.parse()?;
        if spec == AddressSpec::Ip(self.rules.reserved_address.into()) {
            return Err(Error::InvalidAddress(address.to_owned()));
        }

        Ok(spec)
    }

    /// Reads the current state of one direction of `address`.
    pub fn read(&self, direction: Direction, address: &AddressSpec) -> Result<Snapshot> {
        StateReader::new(&self.backend).read(direction, address)
    }

    /// Validates the input, then reconciles one direction of `address` with `desired`.
    pub fn apply(&self, direction: Direction, address: &str, desired: &RawParams) -> Result<()> {
        let (address, desired) = self.validate(address, desired)?;
        self.apply_params(direction, &address, &desired)
    }

    /// Reconciles one direction of `address` with already validated parameters.
    pub fn apply_params(
        &self,
        direction: Direction,
        address: &AddressSpec,
        desired: &ShapingParams,
    ) -> Result<()> {
        let desired = desired.clone().normalized();
        let Snapshot { mut rule, queue } = self.read(direction, address)?;

        if queue.is_none() {
            if let Some(orphan) = rule.take() {
                tracing::warn!(%direction, %address, rule = orphan.rule_id, "rule without queue, tearing down");
                self.teardown(&orphan, false)?;
            }
        }

        if rule.is_none() {
            self.remove_orphans()?;
        }

        if desired.is_unshaped() {
            match rule {
                Some(rule) => {
                    self.teardown(&rule, queue.is_some())?;
                    tracing::info!(%direction, %address, "removed shaping");
                }
                None => tracing::debug!(%direction, %address, "not shaped, nothing to remove"),
            }
            return Ok(());
        }

        let queue_id = match (&rule, &queue) {
            (Some(_), Some(current)) => {
                if current.params() == desired {
                    tracing::debug!(%direction, %address, queue = current.queue_id, "queue up to date");
                } else {
                    // Absent fields are not sent, so the backend keeps deciding their value.
                    self.backend.configure_queue(&Pipe::with_params(current.queue_id, &desired))?;
                    tracing::info!(%direction, %address, queue = current.queue_id, %desired, "updated queue");
                }
                current.queue_id
            }
            _ => {
                let queue_id = self.allocator.allocate(&self.backend)?;
                self.backend.configure_queue(&Pipe::with_params(queue_id, &desired))?;
                tracing::info!(%direction, %address, queue = queue_id, %desired, "created queue");
                queue_id
            }
        };

        if rule.is_none() {
            let (from, to) = direction.endpoints(address);
            let mut spec = RuleSpec::pipe(queue_id, from, to, direction);
            let mut numbers = None;
            if from.is_any() && to.is_any() {
                spec = spec.with_id(self.wildcard_rule_id(direction));
            } else {
                let listed = RuleNumbers::from_listing(&self.backend.list_rules()?, self.rules)?;
                if let Some(id) = listed.next()? {
                    spec = spec.with_id(id);
                }
                numbers = Some(listed);
            }

            let output = self.backend.add_rule(&spec)?;
            let rule_id = parser::parse_confirmation(&output)?;
            if numbers.is_some_and(|numbers| numbers.is_taken(rule_id)) {
                return Err(Error::ProtocolViolation(format!(
                    "{rule_id} already in use: {}",
                    output.trim()
                )));
            }
            tracing::info!(%direction, %address, rule = rule_id, queue = queue_id, "created rule");
        }

        Ok(())
    }

    /// Validates both directions, then shapes traffic towards `address` with `down` and traffic
    /// from it with `up`.
    pub fn set(&self, address: &str, down: &RawParams, up: &RawParams) -> Result<()> {
        // Neither direction is touched unless both are valid.
        let (up_address, up) = self.validate(address, up)?;
        let (down_address, down) = self.validate(address, down)?;

        self.apply_params(Direction::Inbound, &down_address, &down)?;
        self.apply_params(Direction::Outbound, &up_address, &up)
    }

    /// Reads both directions of `address`.
    pub fn get(&self, address: &str) -> Result<LinkState> {
        let address = self.parse_address(address)?;

        Ok(LinkState {
            down: self.read(Direction::Inbound, &address)?,
            up: self.read(Direction::Outbound, &address)?,
        })
    }

    /// Removes all shaping of `address`.
    pub fn clear(&self, address: &str) -> Result<()> {
        self.set(address, &RawParams::default(), &RawParams::default())
    }

    /// Deletes the rule, then its queue, then the identifier reserved for the queue.
    fn teardown(&self, rule: &ClassificationRule, queue_present: bool) -> Result<()> {
        self.backend.delete_rule(rule.rule_id)?;
        if queue_present {
            self.backend.delete_queue(rule.queue_id)?;
        }
        self.allocator.release(&self.backend, rule.queue_id)?;

        tracing::debug!(rule = rule.rule_id, queue = rule.queue_id, "tore down rule");
        Ok(())
    }

    /// Removes identifiers no rule refers to, along with their queue. They are left behind when
    /// creating a rule fails after its queue was set up.
    fn remove_orphans(&self) -> Result<()> {
        let listing = self.backend.list_rules()?;
        let referenced: HashSet<QueueId> =
            parser::parse_rules(&listing)?.into_iter().map(|rule| rule.queue_id).collect();

        let reader = StateReader::new(&self.backend);
        for id in self.allocator.reserved(&listing) {
            if referenced.contains(&id) {
                continue;
            }

            if reader.queue(id)?.is_some() {
                self.backend.delete_queue(id)?;
            }
            self.allocator.release(&self.backend, id)?;
            tracing::warn!(queue = id, "removed identifier left behind by an earlier failure");
        }

        Ok(())
    }

    /// Rule number for an any-to-any rule. Wildcards sit right below the default rule, one slot
    /// per direction, so that they are evaluated after every address-specific rule.
    pub fn wildcard_rule_id(&self, direction: Direction) -> RuleId {
        self.rules.wildcard_rule_id(direction)
    }
}
