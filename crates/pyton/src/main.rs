//! Command-line driver for the Pyton bytecode-to-C transpiler.
//!
//! `pyton build` runs the full pipeline end to end; `pyton dump-bytecode`
//! exposes the loader's output for debugging a single module without
//! running the rest of the pipeline.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use pyton_core::{loader, PipelineConfig, PytonPipeline};

#[derive(Parser)]
#[command(name = "pyton", version, about = "Ahead-of-time bytecode-to-C transpiler")]
struct Cli {
    /// Increase log verbosity (-v, -vv). Overridden by `RUST_LOG` if set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Transpile an entry module into a freestanding C translation unit.
    Build {
        /// Entry module source path.
        #[arg(short, long)]
        input: PathBuf,

        /// Output path for the generated C source. Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Search root for resolving `import` targets. Defaults to the
        /// entry file's own directory.
        #[arg(long)]
        module_root: Option<PathBuf>,
    },

    /// Load a module and print its bytecode without transpiling it.
    DumpBytecode {
        /// Entry module source path.
        #[arg(short, long)]
        input: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match &cli.command {
        Command::Build {
            input,
            output,
            module_root,
        } => run_build(input, output.as_deref(), module_root.clone()),
        Command::DumpBytecode { input } => run_dump_bytecode(input),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            for cause in err.chain().skip(1) {
                eprintln!("{} {cause}", "caused by:".red());
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_directive = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn run_build(input: &std::path::Path, output: Option<&std::path::Path>, module_root: Option<PathBuf>) -> anyhow::Result<()> {
    let pipeline = PytonPipeline::with_config(PipelineConfig { module_root });
    let c_source = pipeline.transpile(input)?;

    match output {
        Some(path) => {
            fs::write(path, c_source)?;
            tracing::info!(output = %path.display(), "wrote translation unit");
        }
        None => print!("{c_source}"),
    }
    Ok(())
}

fn run_dump_bytecode(input: &std::path::Path) -> anyhow::Result<()> {
    let pipeline = PytonPipeline::new();
    let code = pipeline.load_entry(input)?;
    print_frame(&code);
    Ok(())
}

/// Pretty-prints one code object's disassembly, then recurses into every
/// nested code constant (function and class bodies alike).
fn print_frame(code: &pyton_core::bytecode::CodeObject) {
    println!("{}", loader::disassemble(code));
    for const_ in &code.consts {
        if let pyton_core::bytecode::Const::Code(nested) = const_ {
            print_frame(nested);
        }
    }
}
