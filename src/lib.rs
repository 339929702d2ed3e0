pub mod bus;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod ledger;
pub mod log;
pub mod orchestration;
pub mod util;

pub use error::{Error, Result};
pub use ledger::{LedgerSnapshot, TaskLedger};
pub use orchestration::{Supervisor, SupervisorHandle};
