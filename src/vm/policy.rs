//! When to compile a method, and when to give up on it.

use crate::config::CompilerConfig;
use crate::jit::error::{BailoutKind, CompileError};
use crate::jit::memory::MemoryError;
use std::fmt;
use tracing::{debug, warn};

/// What the policy knows about one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodState {
    /// Running in the interpreter.
    Interpreted { invocations: u32, failures: u32 },
    /// Installed in the code cache under this index.
    Compiled(u16),
    /// Never compiled again.
    NotCompilable,
}

impl Default for MethodState {
    fn default() -> Self {
        MethodState::Interpreted {
            invocations: 0,
            failures: 0,
        }
    }
}

/// What to do with the current invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Interpret,
    /// The method just became hot.
    Compile,
    RunCompiled(u16),
}

/// Per-method invocation counters and compilation outcomes.
#[derive(Debug, Clone)]
pub struct JitPolicy {
    enabled: bool,
    threshold: u32,
    max_failures: u32,
    methods: Vec<MethodState>,
    compile_count: usize,
}

impl JitPolicy {
    pub fn new(config: &CompilerConfig) -> Self {
        Self {
            enabled: config.jit_enabled(),
            threshold: config.jit_threshold.max(1),
            max_failures: config.max_compile_failures,
            methods: Vec::new(),
            compile_count: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self, method: usize) -> MethodState {
        self.methods.get(method).copied().unwrap_or_default()
    }

    /// Number of successful compilations.
    pub fn compile_count(&self) -> usize {
        self.compile_count
    }

    fn slot(&mut self, method: usize) -> &mut MethodState {
        if method >= self.methods.len() {
            self.methods.resize(method + 1, MethodState::default());
        }
        &mut self.methods[method]
    }

    /// Count an invocation of `method`.
    pub fn record_invocation(&mut self, method: usize) -> Decision {
        let enabled = self.enabled;
        let threshold = self.threshold;
        match self.slot(method) {
            MethodState::Compiled(index) => Decision::RunCompiled(*index),
            MethodState::NotCompilable => Decision::Interpret,
            MethodState::Interpreted { invocations, .. } => {
                *invocations = invocations.saturating_add(1);
                if enabled && *invocations == threshold {
                    debug!(target: "jcore::jit", method, invocations = threshold, "hot method");
                    Decision::Compile
                } else {
                    Decision::Interpret
                }
            }
        }
    }

    pub fn record_success(&mut self, method: usize, cache_index: u16) {
        *self.slot(method) = MethodState::Compiled(cache_index);
        self.compile_count += 1;
    }

    /// Record a bail-out. Returns true if the method will never be compiled again.
    pub fn record_failure(&mut self, method: usize, error: &CompileError) -> bool {
        self.fail(method, error.kind() == BailoutKind::Unsupported, error)
    }

    /// The code cache had no room for the compiled method. Counted like a
    /// resource bail-out.
    pub fn record_install_failure(&mut self, method: usize, error: &MemoryError) -> bool {
        self.fail(method, false, error)
    }

    fn fail(&mut self, method: usize, unsupported: bool, reason: &dyn fmt::Display) -> bool {
        let max_failures = self.max_failures;
        let state = self.slot(method);
        let failures = match *state {
            MethodState::Interpreted { failures, .. } => failures + 1,
            _ => 1,
        };
        let permanent = unsupported || failures >= max_failures;
        *state = if permanent {
            MethodState::NotCompilable
        } else {
            // Hot again after another full threshold of invocations.
            MethodState::Interpreted {
                invocations: 0,
                failures,
            }
        };
        if permanent {
            warn!(target: "jcore::jit", method, failures, reason = %reason, "method not compilable");
        }
        permanent
    }

    /// The compiled code of `method` is gone; count it from scratch.
    pub fn record_eviction(&mut self, method: usize) {
        let state = self.slot(method);
        if let MethodState::Compiled(_) = state {
            *state = MethodState::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(threshold: u32, max_failures: u32) -> JitPolicy {
        JitPolicy::new(&CompilerConfig {
            jit_mode: crate::config::JitMode::On,
            jit_threshold: threshold,
            max_compile_failures: max_failures,
            ..CompilerConfig::default()
        })
    }

    #[test]
    fn test_threshold_triggers_once() {
        let mut p = policy(3, 3);
        assert_eq!(p.record_invocation(0), Decision::Interpret);
        assert_eq!(p.record_invocation(0), Decision::Interpret);
        assert_eq!(p.record_invocation(0), Decision::Compile);
        assert_eq!(p.record_invocation(0), Decision::Interpret);
    }

    #[test]
    fn test_compiled_method_runs_compiled() {
        let mut p = policy(1, 3);
        assert_eq!(p.record_invocation(2), Decision::Compile);
        p.record_success(2, 7);
        assert_eq!(p.record_invocation(2), Decision::RunCompiled(7));
        assert_eq!(p.compile_count(), 1);

        p.record_eviction(2);
        assert_eq!(p.state(2), MethodState::default());
    }

    #[test]
    fn test_unsupported_is_permanent() {
        let mut p = policy(1, 3);
        p.record_invocation(0);
        assert!(p.record_failure(0, &CompileError::unsupported(4, "irem")));
        assert_eq!(p.state(0), MethodState::NotCompilable);
        assert_eq!(p.record_invocation(0), Decision::Interpret);
    }

    #[test]
    fn test_resource_failures_retry_until_limit() {
        let mut p = policy(2, 2);
        let full = CompileError::CodeBufferFull { limit: 16 };

        p.record_invocation(0);
        assert_eq!(p.record_invocation(0), Decision::Compile);
        assert!(!p.record_failure(0, &full));
        assert_eq!(
            p.state(0),
            MethodState::Interpreted {
                invocations: 0,
                failures: 1
            }
        );

        p.record_invocation(0);
        assert_eq!(p.record_invocation(0), Decision::Compile);
        assert!(p.record_failure(0, &full));
        assert_eq!(p.state(0), MethodState::NotCompilable);
    }

    #[test]
    fn test_disabled_never_compiles() {
        let mut p = JitPolicy::new(&CompilerConfig {
            jit_mode: crate::config::JitMode::Off,
            jit_threshold: 1,
            ..CompilerConfig::default()
        });
        assert!(!p.is_enabled());
        assert_eq!(p.record_invocation(0), Decision::Interpret);
    }
}
