//! rcc command-line interface
//!
//! Thin glue over the library: argument parsing, file reading, output
//! writing, and the exit code. The compiler core lives in the `rcc`
//! library crate.
//!
//! Single-dash spellings traditional for C compilers (`-std=c99`,
//! `-arch=s390`, `-fsyntax-only`, `-dump-ir`) are normalized to clap's
//! long-option syntax before parsing.

use clap::{CommandFactory, Parser as ClapParser};
use clap_complete::{generate, Shell};
use rcc::{backend_names, Options, Session, Standard};
use std::io;
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "rcc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Retargetable C compiler", long_about = None)]
struct Cli {
    /// Output path (defaults to the first input with a .s extension)
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<PathBuf>,

    /// Language standard (c89, c90, c99, c11, c23, gnu89, gnu99)
    #[arg(long = "std", value_name = "STD", default_value = "gnu99")]
    std: String,

    /// Target architecture (arm64, arm64-darwin, s390)
    #[arg(long = "arch", value_name = "ARCH", default_value = "arm64")]
    arch: String,

    /// Optimization level (0, g, 1, 2, 3)
    #[arg(short = 'O', value_name = "LEVEL", default_value = "1")]
    opt: String,

    /// Preprocess only; print tokens with line markers
    #[arg(short = 'E')]
    preprocess_only: bool,

    /// Parse and analyze only; emit nothing
    #[arg(long = "fsyntax-only")]
    syntax_only: bool,

    /// Dump the parse tree
    #[arg(long = "dump-ast")]
    dump_ast: bool,

    /// Dump the analyzed, typed tree
    #[arg(long = "dump-sema")]
    dump_sema: bool,

    /// Dump the IR module
    #[arg(long = "dump-ir")]
    dump_ir: bool,

    /// Add a directory to the include search path
    #[arg(short = 'I', value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Define a macro (NAME or NAME=VALUE)
    #[arg(short = 'D', value_name = "NAME[=VALUE]")]
    define: Vec<String>,

    /// Warning switches (all, extra, error)
    #[arg(short = 'W', value_name = "GROUP")]
    warn: Vec<String>,

    /// Verbose pass logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Generate shell completions and exit
    #[arg(long = "completions", value_name = "SHELL")]
    completions: Option<Shell>,

    /// Input files
    #[arg(value_name = "FILE")]
    inputs: Vec<PathBuf>,
}

/// Rewrite `-std=...`-style arguments into clap's long-option syntax.
fn normalize_args() -> Vec<String> {
    std::env::args()
        .map(|arg| {
            if arg.starts_with("-std=")
                || arg.starts_with("-arch=")
                || arg == "-fsyntax-only"
                || arg == "-dump-ast"
                || arg == "-dump-sema"
                || arg == "-dump-ir"
            {
                format!("-{}", arg)
            } else {
                arg
            }
        })
        .collect()
}

fn main() {
    let cli = Cli::parse_from(normalize_args());

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "rcc", &mut io::stdout());
        return;
    }

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_writer(io::stderr)
            .init();
    }

    let Some(std) = Standard::from_tag(&cli.std) else {
        eprintln!("rcc: error: unknown standard '{}'", cli.std);
        process::exit(2);
    };
    if rcc::codegen::target_layout(&cli.arch).is_none() {
        eprintln!(
            "rcc: error: unknown target '{}' (expected one of: {})",
            cli.arch,
            backend_names().join(", ")
        );
        process::exit(2);
    }
    if cli.inputs.is_empty() {
        eprintln!("rcc: error: no input files");
        process::exit(2);
    }

    let opt_level = match cli.opt.as_str() {
        "0" | "g" => 0,
        "1" => 1,
        "2" => 2,
        "3" => 3,
        other => {
            eprintln!("rcc: error: invalid optimization level '{}'", other);
            process::exit(2);
        }
    };

    let mut options = Options {
        std,
        arch: cli.arch.clone(),
        opt_level,
        preprocess_only: cli.preprocess_only,
        syntax_only: cli.syntax_only,
        dump_ast: cli.dump_ast,
        dump_sema: cli.dump_sema,
        dump_ir: cli.dump_ir,
        ..Options::default()
    };
    options.include_paths = cli.include.clone();
    for def in &cli.define {
        match def.split_once('=') {
            Some((name, value)) => options
                .defines
                .push((name.to_string(), Some(value.to_string()))),
            None => options.defines.push((def.clone(), None)),
        }
    }
    for w in &cli.warn {
        match w.as_str() {
            "all" => options.wall = true,
            "extra" => options.wextra = true,
            "error" => options.werror = true,
            other => eprintln!("rcc: warning: unknown warning group '-W{}'", other),
        }
    }

    let mut session = match Session::new(options) {
        Ok(session) => session,
        Err(msg) => {
            eprintln!("rcc: error: {}", msg);
            process::exit(1);
        }
    };
    for input in &cli.inputs {
        session.compile_path(input);
    }
    let (output, diags) = session.finish();

    eprint!("{}", diags.render());

    match output {
        Some(text) if cli.preprocess_only || cli.dump_ast || cli.dump_sema || cli.dump_ir => {
            print!("{}", text);
        }
        Some(text) if cli.syntax_only => {
            let _ = text;
        }
        Some(text) => {
            let path = cli.output.clone().unwrap_or_else(|| {
                let mut p = cli.inputs[0].clone();
                p.set_extension("s");
                p
            });
            if let Err(e) = std::fs::write(&path, text) {
                eprintln!("rcc: error: cannot write '{}': {}", path.display(), e);
                process::exit(1);
            }
        }
        None => {}
    }

    if diags.error_count() > 0 {
        process::exit(1);
    }
}
