use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpecflowError {
    #[error("not initialized: run 'specflow init'")]
    NotInitialized,

    #[error("already initialized: {0} exists")]
    AlreadyInitialized(String),

    #[error("state document is unreadable ({reason}); run 'specflow init --force' to reinitialize")]
    Schema { reason: String },

    #[error("unsupported schema version '{found}' (this build understands up to {supported})")]
    UnsupportedSchemaVersion { found: String, supported: String },

    #[error("invalid key path '{0}'")]
    InvalidKeyPath(String),

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("unknown step '{0}': expected one of specify, clarify, plan, tasks, analyze, checklist, implement, verify")]
    UnknownStep(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("invalid phase number '{0}': expected 1-4 digits")]
    InvalidPhaseNumber(String),

    #[error("phase not found: {0}")]
    PhaseNotFound(String),

    #[error("no active phase: run 'specflow phase start <number>'")]
    NoActivePhase,

    #[error("ambiguous input: {0}")]
    AmbiguousInput(String),

    #[error("phase {0} is already archived")]
    AlreadyArchived(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("migration rolled back: {0}")]
    MigrationRolledBack(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SpecflowError {
    /// True for errors whose only recovery is reinitializing the state document.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SpecflowError::Schema { .. } | SpecflowError::UnsupportedSchemaVersion { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SpecflowError>;
