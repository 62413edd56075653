//! Method compiler for the i386 target.
//!
//! This module provides:
//! - Label, literal pool and relocation bookkeeping for one code buffer
//! - The virtual stack frame that tracks where every local and stack slot lives
//! - Register and x87 stack allocation
//! - A template compiler driven by [`CompilationSession`]
//! - Compiled method descriptors and the executable code cache

pub mod arena;
pub mod codebuf;
pub mod compiled_method;
pub mod compiler;
pub mod error;
pub mod fpu;
pub mod frame;
pub mod i386;
pub mod label;
pub mod literal;
pub mod memory;
pub mod regalloc;
pub mod relocation;
pub mod stackmap;

pub use compiled_method::{CompileStats, CompiledMethod, MethodSummary};
pub use compiler::CompilationSession;
pub use error::{BailoutKind, CompileError};
pub use frame::{Location, Residence, VirtualStackFrame};
pub use label::BinaryLabel;
pub use literal::{LiteralPool, LiteralPoolElement};
pub use memory::{CodeCache, MemoryError};

use crate::config::CompilerConfig;
use crate::vm::bytecode::Method;
use tracing::{debug, warn};

/// Compile `method` in one session.
///
/// A bail-out is reported as an error and leaves nothing behind; the caller
/// keeps interpreting the method.
pub fn compile_method(
    method: &Method,
    config: &CompilerConfig,
) -> Result<CompiledMethod, CompileError> {
    debug!(
        target: "jcore::jit",
        method = %method.name,
        bytecodes = method.code.len(),
        "compiling"
    );
    let result = CompilationSession::new(method, config).and_then(CompilationSession::compile);
    match &result {
        Ok(compiled) => {
            let stats = compiled.stats();
            debug!(
                target: "jcore::jit",
                method = %method.name,
                code_size = stats.code_size,
                literals = stats.literal_count,
                flushes = stats.flush_count,
                "compiled"
            );
        }
        Err(e) => {
            warn!(
                target: "jcore::jit",
                method = %method.name,
                kind = ?e.kind(),
                reason = %e,
                "compilation bailed out"
            );
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::BasicType;

    #[test]
    fn test_compile_method() {
        let m = Method::new("inc", 1, 2, &[BasicType::Int])
            .with_code(&["iload 0", "iconst 1", "iadd", "ireturn"])
            .unwrap();
        let compiled = compile_method(&m, &CompilerConfig::default()).unwrap();
        assert_eq!(compiled.name(), "inc");
        assert_eq!(compiled.code_size(), compiled.stats().code_size);
    }

    #[test]
    fn test_compile_method_bails_out() {
        let m = Method::new("div", 2, 2, &[BasicType::Int, BasicType::Int])
            .with_code(&["iload 0", "iload 1", "idiv", "ireturn"])
            .unwrap();
        let err = compile_method(&m, &CompilerConfig::default()).unwrap_err();
        assert_eq!(err.kind(), BailoutKind::Unsupported);
    }
}
