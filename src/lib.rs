//! openocd-launch
//!
//! Configuration driven launcher and remote control for OpenOCD debug
//! sessions. A declarative template section is resolved into an execution
//! plan, validated, and run either against local processes (debug server
//! plus debugger front-end) or delegated to a remote agent over an
//! authenticated streaming channel.

pub mod config;
pub mod error;
pub mod executor;
pub mod plan;
pub mod process;
pub mod remote;
pub mod template;

pub use config::Args;
pub use error::{LaunchError, Result};
pub use executor::Controller;
pub use plan::{Mode, ResolvedPlan, SubstitutionContext};
