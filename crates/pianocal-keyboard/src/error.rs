/// Errors raised while marking corners or building a keyboard frame.
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum FrameError {
    #[error("degenerate keyboard quadrilateral: {reason}")]
    DegenerateQuadrilateral { reason: String },
    #[error("black-key length must be positive and finite, got {0}")]
    InvalidBlackKeyLength(f64),
}

impl FrameError {
    pub(crate) fn degenerate(reason: impl Into<String>) -> Self {
        Self::DegenerateQuadrilateral {
            reason: reason.into(),
        }
    }
}
