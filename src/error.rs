use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::roles::Role;

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("cache key part {part:?} contains the reserved separator {separator:?}")]
    InvalidCacheKey {
        part: String,
        separator: &'static str,
    },

    #[error("{what} is not configured; set {env_var} or add it to {settings}")]
    MissingConfig {
        what: String,
        env_var: String,
        settings: String,
    },

    #[error("{message} (tried {})", attempted.join(", "))]
    Resolution {
        role: Role,
        message: &'static str,
        attempted: Vec<String>,
    },

    #[error("{method} {url} failed with status {status}: {body}")]
    HttpStatus {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("{method} {url} failed: {reason}")]
    HttpTransport {
        method: &'static str,
        url: String,
        reason: String,
    },

    #[error("{failed} of {total} jobs did not succeed")]
    JobsFailed { failed: usize, total: usize },
}

/// A failure shared by every caller that awaited the same in-flight computation.
#[derive(Clone, Debug)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Downcast the original error, e.g. to match on an [`OperatorError`].
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}
