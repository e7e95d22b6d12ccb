#![warn(missing_docs)]

//! tabletmgr controller: operator commands, topology validation, shard
//! reparenting and clone orchestration over the tablet agents.

pub mod cli;
pub mod clone;
pub mod config;
pub mod error;
pub mod reparent;
pub mod validator;
pub mod wrangler;

pub use clone::CloneOptions;
pub use config::CtlConfig;
pub use error::WranglerError;
pub use reparent::ReparentReport;
pub use wrangler::{InitTablet, Wrangler, DEFAULT_ACTION_TIMEOUT, DEFAULT_LOCK_TIMEOUT, DEFAULT_RPC_TIMEOUT};
