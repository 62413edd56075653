//! Compiler and runtime configuration types.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. CLI flags are applied on top of whatever was loaded.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Error type for loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// JIT enabled (compile hot methods)
    On,
    /// Automatic: JIT enabled if supported on this platform
    #[default]
    Auto,
}

/// Where a compiled method keeps its code-cache index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheIndexPolicy {
    /// High bits of the packed flags/size header.
    #[default]
    HeaderBits,
    /// 12-bit field inside the prologue's execution sensor operand.
    Prologue,
}

/// Configuration for the method compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    pub jit_mode: JitMode,
    pub jit_threshold: u32,
    /// Resource bail-outs tolerated before a method is never compiled again.
    pub max_compile_failures: u32,
    pub trace_jit: bool,
    /// Maximum bytes of code (including the literal pool) per method.
    pub code_buffer_size: usize,
    pub max_literals: usize,
    /// Bytes available to compiler objects per compilation.
    pub arena_size: usize,
    /// Upper bound on locals plus operand stack slots.
    pub max_locations: usize,
    /// Model the x87 register stack. Without it floating point bails out.
    pub fpu_stack: bool,
    pub cache_index: CacheIndexPolicy,
    /// Stamp compiler objects with (tag, size) headers for reverse lookup.
    pub track_compiler_objects: bool,
    pub code_cache_size: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            jit_threshold: 1000,
            max_compile_failures: 3,
            trace_jit: false,
            code_buffer_size: 16 * 1024,
            max_literals: 256,
            arena_size: 64 * 1024,
            max_locations: 64,
            fpu_stack: true,
            cache_index: CacheIndexPolicy::HeaderBits,
            track_compiler_objects: cfg!(debug_assertions),
            code_cache_size: 1024 * 1024,
        }
    }
}

impl CompilerConfig {
    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: CompilerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_locations > 64 {
            return Err(ConfigError::Invalid(format!(
                "max_locations {} exceeds the 64-slot literal mask",
                self.max_locations
            )));
        }
        if self.code_buffer_size == 0 {
            return Err(ConfigError::Invalid("code_buffer_size must be non-zero".into()));
        }
        if self.jit_threshold == 0 {
            return Err(ConfigError::Invalid("jit_threshold must be at least 1".into()));
        }
        Ok(())
    }

    /// Whether the JIT should run at all on this host.
    pub fn jit_enabled(&self) -> bool {
        match self.jit_mode {
            JitMode::Off => false,
            JitMode::On => true,
            JitMode::Auto => cfg!(unix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CompilerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.jit_threshold, 1000);
        assert!(config.fpu_stack);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = CompilerConfig::from_toml_str(
            r#"
            jit_threshold = 10
            cache_index = "prologue"
            "#,
        )
        .unwrap();
        assert_eq!(config.jit_threshold, 10);
        assert_eq!(config.cache_index, CacheIndexPolicy::Prologue);
        assert_eq!(config.max_literals, 256);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            CompilerConfig::from_toml_str("gc_mode = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_too_many_locations_rejected() {
        assert!(matches!(
            CompilerConfig::from_toml_str("max_locations = 65"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_jit_mode_off() {
        let config = CompilerConfig {
            jit_mode: JitMode::Off,
            ..Default::default()
        };
        assert!(!config.jit_enabled());
    }
}
