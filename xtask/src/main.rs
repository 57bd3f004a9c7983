mod build;
mod qemu;
mod runner;
mod standard;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};

use crate::build::discover_examples;
use crate::runner::{RunOptions, run_example};

#[derive(Parser)]
#[command(name = "xtask", about = "Build and test tasks for usart-bus")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a testsuite scenario in QEMU and print its output
    Qemu {
        /// Name of the scenario to run
        example: String,

        /// Run in release mode
        #[arg(long)]
        release: bool,
    },

    /// Run all scenarios and compare output against expected
    Test {
        /// Only run scenarios whose name contains this
        filter: Option<String>,

        /// Update expected output files instead of comparing
        #[arg(long)]
        bless: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Qemu { example, release } => {
            let opts = RunOptions {
                verbose: true,
                bless: false,
                release,
            };
            if !run_example(&example, &opts)? {
                bail!("'{example}' failed");
            }
        }

        Commands::Test { filter, bless } => {
            let examples = discover_examples()?;
            let examples: Vec<_> = match filter {
                Some(ref f) => examples.into_iter().filter(|e| e.contains(f)).collect(),
                None => examples,
            };

            if examples.is_empty() {
                bail!("No tests found");
            }

            let opts = RunOptions {
                verbose: false,
                bless,
                release: false,
            };
            let mut passed = 0;
            let mut failed = 0;

            for example in &examples {
                println!("\n=== Test: {example} ===");
                match run_example(example, &opts) {
                    Ok(true) => passed += 1,
                    Ok(false) => failed += 1,
                    Err(e) => {
                        println!("  ERROR: {e:#}");
                        failed += 1;
                    }
                }
            }

            println!("\n=== Summary ===");
            println!("{passed} passed, {failed} failed");

            if failed > 0 {
                bail!("{failed} test(s) failed");
            }
        }
    }

    Ok(())
}
