//! Compilation bail-outs.
//!
//! Every variant ends the compilation of one method and sends it back to
//! the interpreter. Invariant violations are not represented here; they
//! panic.

/// Why a method compilation was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("code buffer full ({limit} bytes)")]
    CodeBufferFull { limit: usize },
    #[error("literal pool full ({limit} entries)")]
    LiteralPoolFull { limit: usize },
    #[error("no allocatable register and nothing to spill")]
    RegistersExhausted,
    #[error("fpu stack exhausted")]
    FpuStackExhausted,
    #[error("compiler arena exhausted: requested {requested} bytes, {available} available")]
    ArenaExhausted { requested: usize, available: usize },
    #[error("frame needs {locations} locations, limit is {limit}")]
    FrameTooLarge { locations: usize, limit: usize },
    #[error("unsupported at bci {bci}: {reason}")]
    Unsupported { bci: usize, reason: String },
}

/// Coarse classification used by the compilation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailoutKind {
    /// Might succeed on a later attempt.
    ResourceExhausted,
    /// Will never compile.
    Unsupported,
}

impl CompileError {
    pub fn unsupported(bci: usize, reason: impl Into<String>) -> Self {
        CompileError::Unsupported {
            bci,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> BailoutKind {
        match self {
            CompileError::Unsupported { .. } | CompileError::FrameTooLarge { .. } => {
                BailoutKind::Unsupported
            }
            _ => BailoutKind::ResourceExhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind() {
        assert_eq!(CompileError::RegistersExhausted.kind(), BailoutKind::ResourceExhausted);
        assert_eq!(
            CompileError::CodeBufferFull { limit: 16 }.kind(),
            BailoutKind::ResourceExhausted
        );
        assert_eq!(CompileError::unsupported(3, "athrow").kind(), BailoutKind::Unsupported);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            CompileError::unsupported(3, "athrow").to_string(),
            "unsupported at bci 3: athrow"
        );
    }
}
