mod bench;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kiln_core::config::{default_config_path, KilnConfig};
use kiln_protocol::ShaderReflection;
use kiln_render::shader::{load_spirv, spirv_version};
use tracing::info;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "kiln - frame execution engine tooling")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to ./kiln.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against the software device and report its counters
    Bench {
        /// Frames to render
        #[arg(short, long, default_value_t = 600)]
        frames: u32,

        /// Draws submitted per frame
        #[arg(short, long, default_value_t = 64)]
        draws: u32,

        /// Distinct programs the draws cycle through
        #[arg(short, long, default_value_t = 4)]
        programs: u32,

        /// Report a stale swapchain on every Nth acquire (0 = never)
        #[arg(long, default_value_t = 0)]
        stale_every: u32,

        /// Seed for the random transforms
        #[arg(long, default_value_t = 1)]
        seed: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Print only the path the configuration is read from
        #[arg(long)]
        path: bool,
    },

    /// Validate a SPIR-V module and show its reflection
    InspectShader {
        /// Compiled SPIR-V file
        spv: PathBuf,

        /// Reflection TOML to validate alongside the module
        #[arg(short, long)]
        reflection: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    kiln_common::logging::init_logging();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Bench {
            frames,
            draws,
            programs,
            stale_every,
            seed,
            json,
        } => {
            let mut config = KilnConfig::load_or_default(&config_path);
            // Every draw of a frame must fit in the draw list.
            config.limits.max_draws = config.limits.max_draws.max(draws as usize);

            let options = bench::BenchOptions {
                frames,
                draws,
                programs,
                stale_every,
                seed,
            };
            let report = bench::run(config, &options)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serialize report")?
                );
            } else {
                bench::print_report(&report);
            }
        }

        Commands::Config { path } => {
            if path {
                println!("{}", config_path.display());
                return Ok(());
            }
            info!("reading configuration from {}", config_path.display());
            let config = KilnConfig::load_or_default(&config_path);
            print!("{}", config.to_toml().context("serialize config")?);
        }

        Commands::InspectShader { spv, reflection } => {
            let words = load_spirv(&spv)
                .with_context(|| format!("failed to load {}", spv.display()))?;
            let (major, minor) = spirv_version(&words).unwrap_or((0, 0));
            println!("{}", spv.display());
            println!("  SPIR-V version: {}.{}", major, minor);
            println!("  Words:          {}", words.len());
            if let Some(bound) = words.get(3) {
                println!("  ID bound:       {}", bound);
            }

            if let Some(path) = reflection {
                let reflection = ShaderReflection::load(&path)
                    .with_context(|| format!("invalid reflection {}", path.display()))?;
                println!("  Stage:          {:?}", reflection.stage);
                for b in &reflection.bindings {
                    println!(
                        "  Binding {}:      {:?} x{}",
                        b.binding, b.descriptor_type, b.count
                    );
                }
                for pc in &reflection.push_constants {
                    println!("  Push constants: {}+{} bytes", pc.offset, pc.size);
                }
            }
        }
    }

    Ok(())
}
