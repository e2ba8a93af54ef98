use std::{env, net::Ipv4Addr, path::PathBuf};

use crate::types::{Direction, RuleId};

/// Environment variable overriding the path of the `ipfw` binary.
pub const IPFW_PATH_ENV: &str = "DNSHAPE_IPFW";

/// Environment variable enabling `sudo` when set to `1` or `true`.
pub const SUDO_ENV: &str = "DNSHAPE_SUDO";

pub const DEFAULT_IPFW_PATH: &str = "ipfw";

/// The highest rule number ipfw accepts. It is taken by the default rule.
pub const DEFAULT_MAX_RULE_ID: u32 = 65535;

/// ipfw's default `net.inet.ip.fw.autoinc_step`.
pub const DEFAULT_AUTO_INCREMENT_STEP: u32 = 100;

/// An address in 240.0.0.0/4, reserved and never routed.
pub const DEFAULT_RESERVED_ADDRESS: Ipv4Addr = Ipv4Addr::new(240, 0, 0, 1);

/// How to invoke the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpfwConfig {
    pub program: PathBuf,
    pub sudo: bool,
}

impl Default for IpfwConfig {
    fn default() -> Self {
        Self { program: PathBuf::from(DEFAULT_IPFW_PATH), sudo: false }
    }
}

impl IpfwConfig {
    /// Reads [`IPFW_PATH_ENV`] and [`SUDO_ENV`], falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(program) = env::var_os(IPFW_PATH_ENV).filter(|p| !p.is_empty()) {
            config.program = PathBuf::from(program);
        }

        if let Ok(sudo) = env::var(SUDO_ENV) {
            config.sudo = matches!(sudo.trim(), "1" | "true" | "yes");
        }

        config
    }

    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }
}

/// Rule numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleConfig {
    /// Wildcard rules are placed right below this number, so they are evaluated after every
    /// address-specific rule.
    pub max_rule_id: u32,
    /// Step ipfw adds to the last rule number when numbering a new rule.
    pub auto_increment_step: u32,
    /// Matched against itself by the placeholder rules used to allocate pipe numbers.
    pub reserved_address: Ipv4Addr,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            max_rule_id: DEFAULT_MAX_RULE_ID,
            auto_increment_step: DEFAULT_AUTO_INCREMENT_STEP,
            reserved_address: DEFAULT_RESERVED_ADDRESS,
        }
    }
}

impl RuleConfig {
    /// Rule number for an any-to-any rule in `direction`. One slot per direction, right below
    /// the default rule.
    pub fn wildcard_rule_id(&self, direction: Direction) -> RuleId {
        let offset = match direction {
            Direction::Outbound => 1,
            Direction::Inbound => 2,
        };
        self.max_rule_id.saturating_sub(offset)
    }

    /// The lowest rule number reserved for wildcard rules. Every other rule is numbered below it.
    pub fn wildcard_floor(&self) -> RuleId {
        self.wildcard_rule_id(Direction::Inbound)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub ipfw: IpfwConfig,
    pub rules: RuleConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self { ipfw: IpfwConfig::from_env(), rules: RuleConfig::default() }
    }
}
