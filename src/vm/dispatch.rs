//! Method invocation dispatch between the interpreter and compiled code.

use super::bytecode::Method;
use super::heap::RootVisitor;
use super::policy::{Decision, JitPolicy, MethodState};
use crate::config::CompilerConfig;
use crate::jit::compile_method;
use crate::jit::memory::{CodeCache, HostPlatform, MemoryError, Platform};
use tracing::debug;

/// How one invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    Interpret,
    Compiled { cache_index: u16, entry: usize },
}

/// Registered methods, their policy state and the code cache.
pub struct Dispatcher<P: Platform = HostPlatform> {
    config: CompilerConfig,
    policy: JitPolicy,
    cache: CodeCache<P>,
    methods: Vec<Method>,
}

impl Dispatcher<HostPlatform> {
    pub fn new(config: CompilerConfig) -> Result<Self, MemoryError> {
        Self::with_platform(config, HostPlatform)
    }
}

impl<P: Platform> Dispatcher<P> {
    pub fn with_platform(config: CompilerConfig, platform: P) -> Result<Self, MemoryError> {
        let cache = CodeCache::with_platform(config.code_cache_size, platform)?;
        Ok(Self {
            policy: JitPolicy::new(&config),
            config,
            cache,
            methods: Vec::new(),
        })
    }

    /// Make `method` callable. Returns its method id.
    pub fn register(&mut self, method: Method) -> usize {
        self.methods.push(method);
        self.methods.len() - 1
    }

    pub fn method(&self, id: usize) -> &Method {
        &self.methods[id]
    }

    pub fn policy(&self) -> &JitPolicy {
        &self.policy
    }

    pub fn cache(&self) -> &CodeCache<P> {
        &self.cache
    }

    /// Decide how to run this invocation of `id`, compiling it if it just
    /// became hot. A failed compilation falls back to the interpreter.
    pub fn invoke(&mut self, id: usize) -> Invocation {
        match self.policy.record_invocation(id) {
            Decision::Interpret => Invocation::Interpret,
            Decision::RunCompiled(cache_index) => self.compiled(cache_index),
            Decision::Compile => match self.compile(id) {
                Some(cache_index) => self.compiled(cache_index),
                None => Invocation::Interpret,
            },
        }
    }

    fn compiled(&self, cache_index: u16) -> Invocation {
        match self.cache.entry_address(cache_index) {
            Some(entry) => Invocation::Compiled { cache_index, entry },
            None => Invocation::Interpret,
        }
    }

    /// Compile and install `id` now. Returns its cache index on success.
    pub fn compile(&mut self, id: usize) -> Option<u16> {
        let compiled = match compile_method(&self.methods[id], &self.config) {
            Ok(compiled) => compiled,
            Err(e) => {
                self.policy.record_failure(id, &e);
                return None;
            }
        };
        let installed = match self.cache.install(compiled.clone()) {
            Err(full @ MemoryError::CacheFull { .. }) => match self.cache.compact() {
                Ok(0) => Err(full),
                Ok(_) => self.cache.install(compiled),
                Err(e) => Err(e),
            },
            result => result,
        };
        match installed {
            Ok(cache_index) => {
                self.policy.record_success(id, cache_index);
                Some(cache_index)
            }
            Err(e) => {
                self.policy.record_install_failure(id, &e);
                None
            }
        }
    }

    /// Drop the compiled code of `id`; it is interpreted until hot again.
    pub fn evict(&mut self, id: usize) -> bool {
        let MethodState::Compiled(cache_index) = self.policy.state(id) else {
            return false;
        };
        self.cache.evict(cache_index);
        self.policy.record_eviction(id);
        debug!(target: "jcore::jit", method = id, cache_index, "compiled code evicted");
        true
    }

    /// Close the holes left by evictions. Returns the bytes reclaimed.
    pub fn compact(&mut self) -> Result<usize, MemoryError> {
        self.cache.compact()
    }

    /// Report every object handle embedded in installed code.
    pub fn oops_do(&mut self, visitor: &mut RootVisitor<'_>) -> Result<(), MemoryError> {
        self.cache.oops_do(visitor)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::JitMode;
    use crate::vm::bytecode::{BasicType, Constant};
    use crate::vm::heap::{collect_roots, ObjectRef};

    fn config(threshold: u32) -> CompilerConfig {
        CompilerConfig {
            jit_mode: JitMode::On,
            jit_threshold: threshold,
            code_cache_size: 64 * 1024,
            ..CompilerConfig::default()
        }
    }

    fn add() -> Method {
        Method::new("add", 2, 2, &[BasicType::Int, BasicType::Int])
            .with_code(&["iload 0", "iload 1", "iadd", "ireturn"])
            .unwrap()
    }

    #[test]
    fn test_hot_method_is_compiled() {
        let mut d = Dispatcher::new(config(2)).unwrap();
        let id = d.register(add());
        assert_eq!(d.invoke(id), Invocation::Interpret);

        let Invocation::Compiled { cache_index, entry } = d.invoke(id) else {
            panic!("method not compiled at threshold");
        };
        assert_eq!(d.cache().entry_address(cache_index), Some(entry));
        assert_eq!(d.invoke(id), Invocation::Compiled { cache_index, entry });
        assert_eq!(d.policy().compile_count(), 1);
    }

    #[test]
    fn test_unsupported_method_stays_interpreted() {
        let mut d = Dispatcher::new(config(1)).unwrap();
        let id = d.register(
            Method::new("rem", 2, 2, &[BasicType::Int, BasicType::Int])
                .with_code(&["iload 0", "iload 1", "irem", "ireturn"])
                .unwrap(),
        );
        assert_eq!(d.invoke(id), Invocation::Interpret);
        assert_eq!(d.policy().state(id), MethodState::NotCompilable);
        assert!(d.cache().is_empty());
    }

    #[test]
    fn test_evict_and_recompile() {
        let mut d = Dispatcher::new(config(1)).unwrap();
        let id = d.register(add());
        assert!(matches!(d.invoke(id), Invocation::Compiled { .. }));
        assert!(d.evict(id));
        assert!(d.cache().is_empty());
        assert!(!d.evict(id));
        assert!(matches!(d.invoke(id), Invocation::Compiled { .. }));
    }

    #[test]
    fn test_installed_literals_are_roots() {
        let mut d = Dispatcher::new(config(1)).unwrap();
        let id = d.register(
            Method::new("obj", 0, 1, &[])
                .with_code(&["ldc 0", "areturn"])
                .unwrap()
                .with_constants(&[Constant::Object(ObjectRef(0x40))]),
        );
        d.invoke(id);
        let roots = collect_roots(|v| d.oops_do(v).unwrap());
        assert_eq!(roots, vec![ObjectRef(0x40)]);
    }
}
