//! jcore - method compiler core for a small-device Java VM
//!
//! This library compiles verified bytecode methods to i386 machine code and
//! manages the resulting code in an executable code cache.

pub mod config;
pub mod jit;
pub mod vm;

// Re-export commonly used types
pub use config::{CacheIndexPolicy, CompilerConfig, JitMode};
pub use jit::{compile_method, CompileError, CompiledMethod};
pub use vm::{Dispatcher, Method};
