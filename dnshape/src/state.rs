use crate::{
    backend::ShaperBackend,
    command,
    error::{Error, Result},
    parser,
    types::{AddressSpec, ClassificationRule, Direction, QueueConfig, QueueId, Snapshot},
};

/// Reads the rule and queue currently shaping one `(address, direction)` pair.
#[derive(Debug, Clone)]
pub struct StateReader<B> {
    backend: B,
}

impl<B: ShaperBackend> StateReader<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns the current [`Snapshot`]. An unconfigured pair yields an empty snapshot.
    pub fn read(&self, direction: Direction, address: &AddressSpec) -> Result<Snapshot> {
        let listing = self.backend.list_rules()?;
        let rules = parser::parse_rules(&listing)?;

        let Some(rule) = select_rule(rules, direction, address) else {
            tracing::debug!(%direction, %address, "no matching rule");
            return Ok(Snapshot::default());
        };

        let queue = self.queue(rule.queue_id)?;

        tracing::debug!(%direction, %address, ?rule, ?queue, "read snapshot");

        Ok(Snapshot { rule: Some(rule), queue })
    }

    /// Returns the configuration of one queue, or `None` if the backend doesn't know it.
    pub fn queue(&self, queue_id: QueueId) -> Result<Option<QueueConfig>> {
        let status = match self.backend.show_queue(queue_id) {
            Ok(status) => status,
            // Some ipfw builds fail instead of printing nothing for an unknown pipe.
            Err(Error::BackendCallFailed(command::Error::NonZero(output))) => {
                tracing::warn!(queue = queue_id, %output, "queue not found");
                String::new()
            }
            Err(e) => return Err(e),
        };

        parser::parse_queue_status(&status, queue_id)
    }
}

/// Picks the rule matching exactly the endpoints `direction` derives from `address`.
///
/// If several rules match, the last one listed wins. Listings are ordered by rule number, so
/// this is the highest numbered one.
pub fn select_rule(
    rules: impl IntoIterator<Item = ClassificationRule>,
    direction: Direction,
    address: &AddressSpec,
) -> Option<ClassificationRule> {
    let (from, to) = direction.endpoints(address);

    rules
        .into_iter()
        .filter(|rule| rule.direction == direction && rule.from == from && rule.to == to)
        .last()
}
