use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use bcopt::code::{Disassembly, undecorated_name};
use bcopt::{ExclusionPolicy, FunctionBody, OptimizerConfig};

#[derive(Parser)]
#[command(name = "bcopt")]
#[command(about = "Peephole optimizer for stack-machine function bodies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Optimize {
        #[arg(help = "Input JSON file holding one function body or an array of them")]
        input: PathBuf,

        #[arg(short, long, help = "Output JSON file")]
        output: PathBuf,

        #[arg(short, long, help = "Optimizer configuration JSON file")]
        config: Option<PathBuf>,

        #[arg(long, help = "Disable dead-store removal and single-use inlining")]
        no_dead_stores: bool,

        #[arg(long, help = "Disable tail-call-to-jump conversion")]
        no_tail_calls: bool,

        #[arg(long, help = "Disable store/load elision, folding, branch pruning and trimming")]
        no_peephole: bool,

        #[arg(long, help = "Keep operand tables as they are")]
        no_compact: bool,

        #[arg(short = 'n', long, help = "Pipeline iterations over each top-level body")]
        iterations: Option<u32>,

        #[arg(short, long = "exclude", help = "Leave units with this name unoptimized")]
        exclude: Vec<String>,

        #[arg(long, help = "Leave units whose source file stem starts with '_' unoptimized")]
        skip_private: bool,
    },
    Disasm {
        #[arg(help = "Input JSON file holding one function body or an array of them")]
        input: PathBuf,

        #[arg(short, long, help = "Also list nested function bodies")]
        recursive: bool,
    },
}

/// Exclusion by unit name and by private source file.
struct CliPolicy {
    excluded: HashSet<String>,
    skip_private: bool,
}

impl ExclusionPolicy for CliPolicy {
    fn should_skip(&self, body: &FunctionBody) -> bool {
        if self.excluded.contains(&undecorated_name(body.name())) {
            return true;
        }
        self.skip_private
            && Path::new(&body.source.filename)
                .file_stem()
                .is_some_and(|stem| stem.to_string_lossy().starts_with('_'))
    }
}

/// Parsed input: the JSON shape is preserved on output.
enum Units {
    One(FunctionBody),
    Many(Vec<FunctionBody>),
}

impl Units {
    fn bodies(&self) -> &[FunctionBody] {
        match self {
            Self::One(body) => std::slice::from_ref(body),
            Self::Many(bodies) => bodies,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Optimize {
            input,
            output,
            config,
            no_dead_stores,
            no_tail_calls,
            no_peephole,
            no_compact,
            iterations,
            exclude,
            skip_private,
        } => {
            let mut options = if let Some(config_path) = config {
                read_config(&config_path)?
            } else {
                OptimizerConfig::default()
            };
            options.remove_dead_stores &= !no_dead_stores;
            options.tail_call_optimize &= !no_tail_calls;
            options.optimize_accessors_and_constants &= !no_peephole;
            options.compact_tables &= !no_compact;
            if let Some(iterations) = iterations {
                options.iterations = iterations;
            }
            options.validate().context("Invalid configuration")?;

            let policy = CliPolicy {
                excluded: exclude.into_iter().collect(),
                skip_private,
            };
            let units = read_units(&input)?;
            let results = bcopt::optimize_batch(units.bodies(), &options, &policy);

            for (original, result) in units.bodies().iter().zip(&results) {
                match &result.diagnostic {
                    Some(err) => println!("Kept {}: {err}", original.name()),
                    None => println!(
                        "Optimized {} ({} -> {} bytes of code)",
                        original.name(),
                        original.code.len(),
                        result.body.code.len()
                    ),
                }
            }

            let mut bodies = results.into_iter().map(|r| r.body);
            let json = match units {
                Units::One(_) => {
                    let body = bodies.next().context("Optimizer returned no body")?;
                    serde_json::to_string_pretty(&body)
                }
                Units::Many(_) => serde_json::to_string_pretty(&bodies.collect::<Vec<_>>()),
            }
            .context("Failed to serialize output")?;
            fs::write(&output, json)
                .with_context(|| format!("Failed to write output to {}", output.display()))?;
            println!("Wrote {}", output.display());
        }
        Commands::Disasm { input, recursive } => {
            let units = read_units(&input)?;
            for body in units.bodies() {
                let listing = Disassembly::new(body)
                    .with_context(|| format!("Failed to decode {}", body.name()))?
                    .recursive(recursive);
                println!("{listing}");
            }
        }
    }

    Ok(())
}

fn read_units(path: &Path) -> Result<Units> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let units =
        parse_units(&contents).with_context(|| format!("Failed to parse {}", path.display()))?;
    tracing::debug!("Read {} units from {}", units.bodies().len(), path.display());
    Ok(units)
}

fn parse_units(contents: &str) -> Result<Units> {
    let value: serde_json::Value = serde_json::from_str(contents)?;
    if value.is_array() {
        Ok(Units::Many(serde_json::from_value(value)?))
    } else {
        Ok(Units::One(serde_json::from_value(value)?))
    }
}

fn read_config(path: &Path) -> Result<OptimizerConfig> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse configuration {}", path.display()))
}
