pub mod config;
pub mod gate;
pub mod init;
pub mod migrate;
pub mod phase;
pub mod reconcile;
pub mod state;

use anyhow::Context;
use specflow_core::state::StateStore;
use std::path::Path;

/// A command that ran to completion but must exit non-zero: a failing gate
/// (1) or unresolved drift (2). Its report has already been printed.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CommandFailure {
    pub code: i32,
    pub message: String,
}

impl CommandFailure {
    pub fn new(code: i32, message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(Self {
            code,
            message: message.into(),
        })
    }
}

pub fn open_store(root: &Path) -> anyhow::Result<StateStore> {
    StateStore::open(root).with_context(|| format!("failed to load state in {}", root.display()))
}
