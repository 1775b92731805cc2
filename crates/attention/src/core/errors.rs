//! Error types emitted by attention controllers.

/// Attention-control error category.
#[derive(Debug)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    InvalidShape { context: String },
    /// The leading dimension is not a multiple of the controller's prompt count.
    BatchMismatch { expected: usize, got: usize },
    /// The step counter ran past the end of the alpha schedule.
    Schedule { step: usize, steps: usize },
    /// The controller or hook was used before being fully configured.
    Configuration { message: String },
    /// Building token-alignment tables failed.
    Alignment(alignment::Error),
    /// A backend-specific failure propagated to the caller.
    Backend { message: String },
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        AttentionError::InvalidShape {
            context: context.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        AttentionError::Configuration {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AttentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttentionError::InvalidShape { context } => {
                write!(f, "invalid tensor shape for {context}")
            }
            AttentionError::BatchMismatch { expected, got } => {
                write!(
                    f,
                    "attention batch {got} is not a multiple of the {expected} prompts being edited"
                )
            }
            AttentionError::Schedule { step, steps } => {
                write!(f, "step {step} is outside the {steps}-row alpha schedule")
            }
            AttentionError::Configuration { message } => f.write_str(message),
            AttentionError::Alignment(err) => write!(f, "token alignment failed: {err}"),
            AttentionError::Backend { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for AttentionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AttentionError::Alignment(err) => Some(err),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend {
            message: err.to_string(),
        }
    }
}

impl From<alignment::Error> for AttentionError {
    fn from(err: alignment::Error) -> Self {
        AttentionError::Alignment(err)
    }
}

pub type Result<T> = std::result::Result<T, AttentionError>;
