//! The line-oriented command interface the engine drives.

use crate::{
    command::Runner,
    config::IpfwConfig,
    error::Result,
    pipe::{Pipe, RuleSpec},
    types::{QueueId, RuleId},
};

/// A packet classifier paired with a queueing subsystem, controlled through text commands.
///
/// Listing and status calls return the backend's raw output; interpreting it is left to
/// [`crate::parser`]. Any failed call is reported as [`crate::Error::BackendCallFailed`].
pub trait ShaperBackend {
    /// Lists every classification rule, one per line.
    fn list_rules(&self) -> Result<String>;

    /// Shows the parameters of one queue.
    fn show_queue(&self, queue: QueueId) -> Result<String>;

    /// Adds a rule, returning the confirmation printed by the backend.
    fn add_rule(&self, rule: &RuleSpec) -> Result<String>;

    /// Creates or reconfigures a queue.
    fn configure_queue(&self, pipe: &Pipe) -> Result<()>;

    fn delete_rule(&self, rule: RuleId) -> Result<()>;

    fn delete_queue(&self, queue: QueueId) -> Result<()>;
}

impl<B: ShaperBackend + ?Sized> ShaperBackend for &B {
    fn list_rules(&self) -> Result<String> {
        (**self).list_rules()
    }

    fn show_queue(&self, queue: QueueId) -> Result<String> {
        (**self).show_queue(queue)
    }

    fn add_rule(&self, rule: &RuleSpec) -> Result<String> {
        (**self).add_rule(rule)
    }

    fn configure_queue(&self, pipe: &Pipe) -> Result<()> {
        (**self).configure_queue(pipe)
    }

    fn delete_rule(&self, rule: RuleId) -> Result<()> {
        (**self).delete_rule(rule)
    }

    fn delete_queue(&self, queue: QueueId) -> Result<()> {
        (**self).delete_queue(queue)
    }
}

/// [`ShaperBackend`] backed by the `ipfw` binary and its dummynet pipes.
#[derive(Debug, Clone)]
pub struct Ipfw {
    runner: Runner,
}

impl Ipfw {
    pub fn new(config: IpfwConfig) -> Self {
        Self { runner: Runner::new(config.program).sudo(config.sudo) }
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }
}

impl Default for Ipfw {
    fn default() -> Self {
        Self::new(IpfwConfig::default())
    }
}

impl ShaperBackend for Ipfw {
    fn list_rules(&self) -> Result<String> {
        Ok(self.runner.run(["list"])?.stdout)
    }

    fn show_queue(&self, queue: QueueId) -> Result<String> {
        Ok(self.runner.run(Pipe::show_args(queue))?.stdout)
    }

    fn add_rule(&self, rule: &RuleSpec) -> Result<String> {
        Ok(self.runner.run(rule.add_args())?.stdout)
    }

    fn configure_queue(&self, pipe: &Pipe) -> Result<()> {
        self.runner.run(pipe.config_args())?;
        Ok(())
    }

    fn delete_rule(&self, rule: RuleId) -> Result<()> {
        self.runner.run(RuleSpec::delete_args(rule))?;
        Ok(())
    }

    fn delete_queue(&self, queue: QueueId) -> Result<()> {
        self.runner.run(Pipe::destroy_args(queue))?;
        Ok(())
    }
}
