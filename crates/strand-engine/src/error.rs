use strand_core::errors::GatewayError;
use strand_core::events::SinkClosed;
use strand_core::tools::ToolError;
use strand_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    SinkClosed(#[from] SinkClosed),

    #[error("turn aborted")]
    Aborted,

    #[error("max steps exceeded: {0}")]
    MaxStepsExceeded(u32),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Errors the caller can no longer observe are not reported as callouts.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::SinkClosed(_) | Self::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        assert_eq!(EngineError::MaxStepsExceeded(50).to_string(), "max steps exceeded: 50");
        assert_eq!(
            EngineError::from(GatewayError::ProviderOverloaded).to_string(),
            "gateway error: provider overloaded"
        );
        assert_eq!(EngineError::from(SinkClosed).to_string(), "event receiver closed");
    }

    #[test]
    fn silent_errors() {
        assert!(EngineError::Aborted.is_silent());
        assert!(EngineError::from(SinkClosed).is_silent());
        assert!(!EngineError::Internal("boom".into()).is_silent());
    }
}
