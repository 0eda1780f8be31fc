pub mod config;
pub mod error;
pub mod gate;
pub mod inspector;
pub mod io;
pub mod migrate;
pub mod migrations;
pub mod paths;
pub mod reconcile;
pub mod roadmap;
pub mod state;
pub mod test_runner;
pub mod types;
pub mod vcs;

pub use error::{Result, SpecflowError};
