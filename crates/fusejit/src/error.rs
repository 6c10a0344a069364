use thiserror::Error;

/// Errors surfaced by assembly, compilation, caching and invocation.
///
/// `Clone` so that every waiter of a single-flight build observes the same error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JitError {
    #[error("op '{kind}' rejected application '{application}': {message}")]
    Contributor {
        kind: String,
        application: String,
        message: String,
    },
    #[error("module assembly failed: {message}")]
    Assembly { message: String },
    #[error("invalid graph: {message}")]
    Graph { message: String },
    #[error("compilation of module {key} failed: {diagnostics}")]
    Compile { key: String, diagnostics: String },
    #[error("cache entry {key} is unreadable: {message}")]
    CacheCorruption { key: String, message: String },
    #[error("failed to load compiled module: {message}")]
    Load { message: String },
    #[error("invalid invocation: {message}")]
    Invocation { message: String },
    #[error("compiled computation failed: {message}")]
    Runtime { message: String },
    #[error("module build was cancelled")]
    Cancelled,
    #[error("{context}: {message}")]
    Io { context: String, message: String },
    #[error("serialization failed: {message}")]
    Serialization { message: String },
}

impl JitError {
    pub fn assembly(message: impl Into<String>) -> Self {
        JitError::Assembly {
            message: message.into(),
        }
    }

    pub fn graph(message: impl Into<String>) -> Self {
        JitError::Graph {
            message: message.into(),
        }
    }

    pub fn load(message: impl Into<String>) -> Self {
        JitError::Load {
            message: message.into(),
        }
    }

    pub fn invocation(message: impl Into<String>) -> Self {
        JitError::Invocation {
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        JitError::Runtime {
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        JitError::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        JitError::Serialization {
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JitError::Cancelled)
    }
}

impl From<bincode::Error> for JitError {
    fn from(err: bincode::Error) -> Self {
        JitError::serialization(err.to_string())
    }
}

pub type JitResult<T> = Result<T, JitError>;

/// Error returned by an [`OpKind`](crate::OpKind) that rejects its inputs.
///
/// Carries only the message; the assembler attaches the op kind and application name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ContributorError {
    message: String,
}

impl ContributorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type ContributorResult<T> = Result<T, ContributorError>;
