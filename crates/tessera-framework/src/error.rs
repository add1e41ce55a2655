//! Error types for the Tessera framework.

use tessera_core::ErrorKind;
use thiserror::Error;

use crate::manager::PluginState;

/// Errors raised while registering middleware.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("middleware '{0}' is already registered")]
    DuplicateMiddleware(String),
}

/// A `required` hook handler failed.
#[derive(Debug, Clone, Error)]
#[error("required handler for hook '{hook}' registered by '{owner}' failed: {message}")]
pub struct HookError {
    pub hook: String,
    pub owner: String,
    pub message: String,
}

/// Errors raised by the [`PluginManager`](crate::manager::PluginManager).
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    #[error("plugin '{plugin}' requires '{dependency}', which is not running")]
    MissingDependency { plugin: String, dependency: String },

    #[error("plugin dependency cycle detected among: {}", .plugins.join(", "))]
    CyclicDependency { plugins: Vec<String> },

    #[error("plugin '{plugin}' is required by: {}", .dependents.join(", "))]
    DependentExists {
        plugin: String,
        dependents: Vec<String>,
    },

    #[error("plugin '{0}' not found")]
    NotFound(String),

    #[error("plugin '{0}' is already installed")]
    AlreadyInstalled(String),

    #[error("plugin '{plugin}' targets plugin API {version:#010x}, host provides {host:#010x}")]
    IncompatibleApi {
        plugin: String,
        version: u32,
        host: u32,
    },

    /// A lifecycle callback failed; the plugin was moved to `Failed` and
    /// rolled back.
    #[error("plugin '{plugin}' failed during {stage}: {message}")]
    Lifecycle {
        plugin: String,
        stage: &'static str,
        message: String,
    },

    #[error("plugin '{plugin}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("plugin '{plugin}' is still {state:?}")]
    StillActive { plugin: String, state: PluginState },

    #[error(transparent)]
    Hook(#[from] HookError),

    /// A batch install stopped at `plugin`; everything installed before it
    /// in the batch was rolled back.
    #[error("batch install aborted at '{plugin}': {source}")]
    BatchFailed {
        plugin: String,
        #[source]
        source: Box<PluginError>,
        rolled_back: Vec<String>,
    },
}

impl PluginError {
    /// Returns the taxonomy kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingDependency { .. } => ErrorKind::MissingDependencyError,
            Self::CyclicDependency { .. } => ErrorKind::CyclicDependencyError,
            Self::DependentExists { .. } => ErrorKind::DependentExistsError,
            Self::NotFound(_) => ErrorKind::NotFoundError,
            Self::BatchFailed { source, .. } => source.kind(),
            Self::AlreadyInstalled(_)
            | Self::IncompatibleApi { .. }
            | Self::Lifecycle { .. }
            | Self::InvalidTransition { .. }
            | Self::StillActive { .. }
            | Self::Hook(_) => ErrorKind::InternalError,
        }
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;
