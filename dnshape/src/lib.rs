#![doc(issue_tracker_base_url = "https://github.com/chainbound/dnshape/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Directional traffic shaping on top of `ipfw` and dummynet.
//!
//! The [`Reconciler`] shapes the traffic to or from an address (or every address) with a
//! bandwidth cap, an added delay and a packet loss rate. Each `(address, direction)` pair maps to
//! one ipfw rule feeding one dummynet pipe; applying the same parameters twice is a no-op.
//!
//! ```no_run
//! use dnshape::{Config, RawParams, Reconciler};
//!
//! let shaper = Reconciler::from_config(Config::from_env());
//!
//! let down = RawParams::new().bandwidth("768000").delay("150").loss("0.0001");
//! shaper.set("1.2.3.4", &down, &RawParams::new()).unwrap();
//!
//! println!("{}", shaper.get("1.2.3.4").unwrap());
//! ```

pub mod allocator;
pub mod backend;
pub mod command;
pub mod config;
mod error;
pub mod params;
pub mod parser;
pub mod pipe;
pub mod reconcile;
pub mod state;
pub mod types;

pub use allocator::{IdentifierAllocator, PlaceholderAllocator};
pub use backend::{Ipfw, ShaperBackend};
pub use config::{Config, IpfwConfig, RuleConfig};
pub use error::{Error, Result};
pub use params::RawParams;
pub use reconcile::Reconciler;
pub use state::StateReader;
pub use types::{
    AddressSpec, ClassificationRule, Direction, LinkState, LossRate, QueueConfig, QueueId, RuleId,
    ShapingParams, Snapshot,
};
