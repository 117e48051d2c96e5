//! NDBN compiler - pack SafeTensors models and BPE merges into .nbbin files.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod common;
mod compile;
mod config;
mod inspect;
mod mock;
mod tokens;

#[derive(Parser)]
#[command(name = "nc")]
#[command(about = "Compile SafeTensors models into memory-mappable NDBN files")]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a SafeTensors model (file or folder of shards) to NDBN
    Compile {
        /// Path to the model file or folder
        #[arg(short, long)]
        model: String,

        /// Path to compile config JSON
        #[arg(short, long)]
        config: Option<String>,

        /// Output path for the .nbbin file
        #[arg(short, long)]
        output: Option<String>,

        /// HuggingFace tokenizer.json whose merges are embedded (overrides config)
        #[arg(short, long)]
        tokenizer: Option<String>,

        /// Generate a template config instead of compiling
        #[arg(long)]
        generate_config: bool,
    },

    /// Print the header and tensor table of an NDBN file
    Inspect {
        /// Path to the .nbbin file
        #[arg(short, long)]
        model: String,

        /// Decode every tensor and report size breakdown and value ranges
        #[arg(long)]
        audit: bool,
    },

    /// Write a small deterministic NDBN file for loader smoke tests
    Mock {
        /// Output path for the mock file
        #[arg(short, long, default_value = "test_model.nbbin")]
        output: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Compile {
            model,
            config,
            output,
            tokenizer,
            generate_config,
        } => {
            if generate_config {
                compile::generate_config_template(&model)?;
            } else {
                compile::run(
                    &model,
                    config.as_deref(),
                    output.as_deref(),
                    tokenizer.as_deref(),
                )?;
            }
        }
        Commands::Inspect { model, audit } => {
            inspect::run(&model, audit)?;
        }
        Commands::Mock { output } => {
            mock::run(&output)?;
        }
    }

    Ok(())
}
