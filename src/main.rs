use clap::{Parser, Subcommand, ValueEnum};
use jcore::config::{CacheIndexPolicy, CompilerConfig};
use jcore::jit::{compile_method, CompiledMethod};
use jcore::vm::bytecode::Method;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CacheIndexArg {
    HeaderBits,
    Prologue,
}

impl From<CacheIndexArg> for CacheIndexPolicy {
    fn from(arg: CacheIndexArg) -> Self {
        match arg {
            CacheIndexArg::HeaderBits => CacheIndexPolicy::HeaderBits,
            CacheIndexArg::Prologue => CacheIndexPolicy::Prologue,
        }
    }
}

#[derive(Parser)]
#[command(name = "jcore")]
#[command(about = "Method compiler core for a small-device Java VM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a method description and print the result
    Compile {
        /// TOML method description
        file: PathBuf,

        /// Compiler configuration file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Print the compiled method as JSON
        #[arg(long)]
        json: bool,

        /// Trace JIT compilation events
        #[arg(long)]
        trace_jit: bool,

        /// Treat floating point arithmetic as unsupported
        #[arg(long)]
        no_fpu_stack: bool,

        /// Where the code-cache index is kept
        #[arg(long, value_enum)]
        cache_index: Option<CacheIndexArg>,
    },
    /// Report whether a method would compile
    Check {
        /// TOML method description
        file: PathBuf,

        /// Compiler configuration file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

const EXIT_BAILED_OUT: u8 = 1;
const EXIT_ERROR: u8 = 2;

fn init_tracing(trace_jit: bool) {
    let filter = if trace_jit {
        EnvFilter::new("warn,jcore=debug")
    } else {
        EnvFilter::try_from_env("JCORE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<CompilerConfig, String> {
    let config = match path {
        Some(path) => CompilerConfig::load(path).map_err(|e| e.to_string())?,
        None => CompilerConfig::default(),
    };
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            file,
            config,
            json,
            trace_jit,
            no_fpu_stack,
            cache_index,
        } => {
            let mut config = match load_config(config.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::from(EXIT_ERROR);
                }
            };
            config.trace_jit |= trace_jit;
            if no_fpu_stack {
                config.fpu_stack = false;
            }
            if let Some(policy) = cache_index {
                config.cache_index = policy.into();
            }
            if let Err(e) = config.validate() {
                eprintln!("error: {}", e);
                return ExitCode::from(EXIT_ERROR);
            }
            init_tracing(config.trace_jit);

            let method = match Method::load(&file) {
                Ok(method) => method,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::from(EXIT_ERROR);
                }
            };
            match compile_method(&method, &config) {
                Ok(compiled) if json => match serde_json::to_string_pretty(&compiled.summary()) {
                    Ok(text) => println!("{}", text),
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return ExitCode::from(EXIT_ERROR);
                    }
                },
                Ok(compiled) => print_summary(&compiled),
                Err(e) => {
                    eprintln!("{}: not compiled: {}", method.name, e);
                    return ExitCode::from(EXIT_BAILED_OUT);
                }
            }
        }
        Commands::Check { file, config } => {
            init_tracing(false);
            let config = match load_config(config.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::from(EXIT_ERROR);
                }
            };
            let method = match Method::load(&file) {
                Ok(method) => method,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::from(EXIT_ERROR);
                }
            };
            match compile_method(&method, &config) {
                Ok(compiled) => {
                    println!("{}: compiles ({} bytes)", method.name, compiled.code_size());
                }
                Err(e) => {
                    println!("{}: bails out ({:?}): {}", method.name, e.kind(), e);
                    return ExitCode::from(EXIT_BAILED_OUT);
                }
            }
        }
    }

    ExitCode::SUCCESS
}

fn print_summary(compiled: &CompiledMethod) {
    let stats = compiled.stats();
    println!("method:       {}", compiled.name());
    println!("code size:    {} bytes", stats.code_size);
    println!("cache index:  {} ({:?})", compiled.cache_index(), compiled.cache_index_policy());
    println!("labels bound: {}", stats.label_count);
    println!("literals:     {}", stats.literal_count);
    println!("flushes:      {}", stats.flush_count);
    println!(
        "fpu:          {} pushes, {} ffrees, max depth {}",
        stats.fpu_pushes, stats.fpu_ffrees, stats.fpu_max_depth
    );
    println!("arena:        {} bytes", stats.arena_bytes);
    println!("relocations:  {}", stats.relocation_count);
    for reloc in compiled.relocations() {
        println!("  {:#06x} {:?}", reloc.offset, reloc.kind);
    }
    println!("stack maps:   {}", stats.stack_map_count);
    for entry in compiled.stack_maps().entries() {
        println!(
            "  pc {:#06x} bci {} locals {:?} stack {:?}",
            entry.native_pc,
            entry.bci,
            entry.local_ref_slots(),
            entry.stack_ref_slots()
        );
    }
    println!("code:");
    for (i, chunk) in compiled.code().chunks(16).enumerate() {
        let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("  {:04x}: {}", i * 16, bytes.join(" "));
    }
}
