use miette::Diagnostic;
use thiserror::Error;

/// Tool error code for "a VM with this name already exists".
pub const ALREADY_EXISTS_CODE: i64 = 18;
/// Tool error code for "no such VM".
pub const NOT_FOUND_CODE: i64 = 3;

#[derive(Debug, Error, Diagnostic)]
pub enum ProvisionError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{reason}")]
    #[diagnostic(help("this request cannot be applied safely; change the configuration"))]
    Invariant { reason: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run `{command}`: {message}")]
    #[diagnostic(help("is the anka CLI installed and on PATH?"))]
    Transport { command: String, message: String },

    #[error("malformed machine readable output: {message}")]
    Protocol { message: String },

    #[error("{message} ({}code {code})", type_prefix(exception_type))]
    Tool {
        code: i64,
        message: String,
        exception_type: String,
    },

    #[error("vm {name} already exists: {message}")]
    AlreadyExists { name: String, message: String },

    #[error("vm {name} not found: {message}")]
    NotFound { name: String, message: String },

    #[error("registry error: {message}")]
    Registry { message: String },

    #[error("`{command}` exited with code {exit_code}")]
    GuestCommand { command: String, exit_code: i32 },

    #[error("build cancelled")]
    Cancelled,

    #[error("step {step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<ProvisionError>,
    },
}

fn type_prefix(exception_type: &str) -> String {
    if exception_type.is_empty() {
        String::new()
    } else {
        format!("{exception_type}, ")
    }
}

impl ProvisionError {
    /// Innermost error, looking through step decoration.
    pub fn root(&self) -> &ProvisionError {
        match self {
            ProvisionError::Step { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), ProvisionError::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), ProvisionError::NotFound { .. })
    }

    /// Re-tag a generic tool failure with a domain meaning for `name`.
    pub(crate) fn classify(self, name: &str) -> Self {
        match self {
            ProvisionError::Tool { code, message, .. } if code == ALREADY_EXISTS_CODE => {
                ProvisionError::AlreadyExists {
                    name: name.to_string(),
                    message,
                }
            }
            ProvisionError::Tool { code, message, .. } if code == NOT_FOUND_CODE => {
                ProvisionError::NotFound {
                    name: name.to_string(),
                    message,
                }
            }
            other => other,
        }
    }

    /// Like [`classify`](Self::classify) but only for the not-found code.
    pub(crate) fn classify_not_found(self, name: &str) -> Self {
        match self {
            ProvisionError::Tool { code, message, .. } if code == NOT_FOUND_CODE => {
                ProvisionError::NotFound {
                    name: name.to_string(),
                    message,
                }
            }
            other => other,
        }
    }
}
