//! Allocation of queue identifiers.
//!
//! ipfw has no way to hand out a free pipe number on its own. Rule numbers however are assigned
//! automatically, so [`PlaceholderAllocator`] adds a rule that can never match and reuses the
//! number ipfw gave it. The placeholder stays in place for as long as the pipe exists.

use std::{collections::BTreeSet, net::Ipv4Addr};

use crate::{
    backend::ShaperBackend,
    config::RuleConfig,
    error::{Error, Result},
    parser,
    pipe::RuleSpec,
    types::{QueueId, RuleId},
};

/// Hands out unique queue identifiers.
pub trait IdentifierAllocator {
    /// Reserves a fresh identifier.
    fn allocate<B: ShaperBackend + ?Sized>(&self, backend: &B) -> Result<QueueId>;

    /// Releases an identifier previously returned by [`IdentifierAllocator::allocate`]. Releasing
    /// an identifier that is no longer reserved is not an error.
    fn release<B: ShaperBackend + ?Sized>(&self, backend: &B, id: QueueId) -> Result<()>;

    /// Returns the identifiers an `ipfw list` output shows as reserved.
    fn reserved(&self, listing: &str) -> Vec<QueueId>;
}

/// Rule and pipe numbers in use, as seen in one `ipfw list` output.
///
/// ipfw numbers a new rule by adding its auto increment step to the last rule before the default
/// one, and stops incrementing once that would reach the default rule. With wildcard rules at the
/// top of the range it would hand out their numbers again, so [`RuleNumbers::next`] then picks
/// the highest free number below them instead.
#[derive(Debug, Clone)]
pub struct RuleNumbers {
    rules: BTreeSet<RuleId>,
    queues: BTreeSet<QueueId>,
    config: RuleConfig,
}

impl RuleNumbers {
    pub fn from_listing(listing: &str, config: RuleConfig) -> Result<Self> {
        let rules = parser::listed_rule_ids(listing).into_iter().collect();
        let queues = parser::parse_rules(listing)?.into_iter().map(|rule| rule.queue_id).collect();

        Ok(Self { rules, queues, config })
    }

    /// Returns true if `id` is used as a rule number or as the number of a referenced pipe.
    pub fn is_taken(&self, id: RuleId) -> bool {
        self.rules.contains(&id) || self.queues.contains(&id)
    }

    /// The number ipfw gives a rule added without one.
    fn automatic(&self) -> RuleId {
        let max = self.config.max_rule_id;
        let step = self.config.auto_increment_step;
        let last = self.rules.range(..max).next_back().copied().unwrap_or(0);

        if last < max.saturating_sub(step) {
            last + step
        } else {
            last
        }
    }

    /// Number for a new rule, or `None` if ipfw's own numbering yields a free one below the
    /// wildcard rules.
    pub fn next(&self) -> Result<Option<RuleId>> {
        let floor = self.config.wildcard_floor();

        let automatic = self.automatic();
        if automatic != 0 && automatic < floor && !self.is_taken(automatic) {
            return Ok(None);
        }

        (1..floor)
            .rev()
            .find(|&id| !self.is_taken(id))
            .map(Some)
            .ok_or(Error::RuleNumbersExhausted(floor))
    }
}

/// Allocates identifiers by adding a counting rule on a reserved address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderAllocator {
    rules: RuleConfig,
}

impl PlaceholderAllocator {
    pub fn new(rules: RuleConfig) -> Self {
        Self { rules }
    }

    /// The address placeholder rules match against itself.
    pub fn address(&self) -> Ipv4Addr {
        self.rules.reserved_address
    }
}

impl IdentifierAllocator for PlaceholderAllocator {
    fn allocate<B: ShaperBackend + ?Sized>(&self, backend: &B) -> Result<QueueId> {
        let numbers = RuleNumbers::from_listing(&backend.list_rules()?, self.rules)?;

        let mut placeholder = RuleSpec::placeholder(self.address());
        if let Some(id) = numbers.next()? {
            placeholder = placeholder.with_id(id);
        }

        let output = backend.add_rule(&placeholder)?;
        let id = parser::parse_confirmation(&output)?;
        if numbers.is_taken(id) {
            return Err(Error::ProtocolViolation(format!("{id} already in use: {}", output.trim())));
        }

        tracing::debug!(id, address = %self.address(), "allocated identifier");

        Ok(id)
    }

    fn release<B: ShaperBackend + ?Sized>(&self, backend: &B, id: QueueId) -> Result<()> {
        let listing = backend.list_rules()?;

        let placeholders =
            parser::placeholder_ids(&listing, self.address()).into_iter().filter(|&p| p == id).count();
        if placeholders == 0 {
            tracing::debug!(id, "placeholder rule already gone");
            return Ok(());
        }

        // `delete` removes every rule with that number.
        let numbered = parser::listed_rule_ids(&listing).into_iter().filter(|&r| r == id).count();
        if numbered > placeholders {
            tracing::warn!(id, "placeholder shares its number with other rules, keeping it");
            return Ok(());
        }

        backend.delete_rule(id)?;
        tracing::debug!(id, "released identifier");

        Ok(())
    }

    fn reserved(&self, listing: &str) -> Vec<QueueId> {
        let ids: BTreeSet<_> = parser::placeholder_ids(listing, self.address()).into_iter().collect();
        ids.into_iter().collect()
    }
}
