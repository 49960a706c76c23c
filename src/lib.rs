//! Command mediation for an untrusted automated operator.
//!
//! Every command request goes through [`CapabilityRegistry::invoke`], which
//! sanitizes it, records the attempt, checks the role allowlist, asks a human
//! when the command looks destructive, and only then runs it locally or over
//! SSH under a timeout.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod exec;
pub mod inventory;
pub mod invocation;
pub mod security;

pub use capabilities::{CapabilityOutput, CapabilityRegistry, Executors};
pub use config::Config;
pub use error::GateError;
pub use invocation::{ActorContext, ArgValue, Arguments};
