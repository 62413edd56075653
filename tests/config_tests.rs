//! Loading configuration and method files from disk.

use std::fs;

use jcore::config::{CacheIndexPolicy, ConfigError, CompilerConfig, JitMode};
use jcore::jit::compile_method;
use jcore::vm::bytecode::MethodParseError;
use jcore::vm::Method;
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, text: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, text).unwrap();
    path
}

#[test]
fn test_load_partial_config() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "jit.toml",
        r#"
jit_mode = "off"
fpu_stack = false
cache_index = "prologue"
"#,
    );
    let config = CompilerConfig::load(&path).unwrap();
    assert_eq!(config.jit_mode, JitMode::Off);
    assert!(!config.fpu_stack);
    assert_eq!(config.cache_index, CacheIndexPolicy::Prologue);
    assert_eq!(config.jit_threshold, CompilerConfig::default().jit_threshold);
    assert!(!config.jit_enabled());
}

#[test]
fn test_unknown_field_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "jit.toml", "jit_treshold = 10\n");
    assert!(matches!(CompilerConfig::load(&path), Err(ConfigError::Parse(_))));
}

#[test]
fn test_missing_config_file() {
    let dir = TempDir::new().unwrap();
    let err = CompilerConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn test_oversized_frame_limit_is_invalid() {
    let config = CompilerConfig {
        max_locations: 65,
        ..CompilerConfig::default()
    };
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_small_code_buffer_from_file_bails_out() {
    let dir = TempDir::new().unwrap();
    let config_path = write(&dir, "tiny.toml", "code_buffer_size = 12\n");
    let method_path = write(
        &dir,
        "add.toml",
        r#"
name = "add"
max_locals = 2
max_stack = 2
params = ["int", "int"]
code = ["iload 0", "iload 1", "iadd", "ireturn"]
"#,
    );
    let config = CompilerConfig::load(&config_path).unwrap();
    let method = Method::load(&method_path).unwrap();
    let err = compile_method(&method, &config).unwrap_err();
    assert_eq!(err, jcore::CompileError::CodeBufferFull { limit: 12 });
}

#[test]
fn test_method_file_errors() {
    let dir = TempDir::new().unwrap();

    let bad_op = write(
        &dir,
        "bad_op.toml",
        r#"
name = "bad"
max_locals = 0
max_stack = 1
code = ["iconst"]
"#,
    );
    assert!(Method::load(&bad_op).is_err());

    let bad_target = write(
        &dir,
        "bad_target.toml",
        r#"
name = "bad"
max_locals = 0
max_stack = 1
code = ["goto 5"]
"#,
    );
    assert!(matches!(
        Method::load(&bad_target),
        Err(MethodParseError::Invalid { bci: 0, .. })
    ));

    assert!(matches!(
        Method::load(&dir.path().join("missing.toml")),
        Err(MethodParseError::Io { .. })
    ));
}
