//! ASPIS driver CLI.
//!
//! Reads a serialized IR module, runs a hardening pipeline over it and
//! writes the transformed module back out.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;

use clap::{CommandFactory, Parser as ClapParser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};

use aspis_ir::Module;
use aspisc::{CfcAlgorithm, HardeningConfig, PassKind, Pipeline, canonical_passes};

#[derive(ClapParser)]
#[command(name = "aspisc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "ASPIS - harden IR modules against transient faults", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CfcChoice {
    None,
    Rasm,
    Racfed,
}

#[derive(Subcommand)]
enum Commands {
    /// Harden a serialized IR module
    Harden {
        /// Input module (JSON)
        input: PathBuf,

        /// Output module path (defaults to `<input>.hardened.json`)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Comma-separated pass list; defaults to the canonical pipeline
        #[arg(long)]
        passes: Option<String>,

        /// Hardening configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Control-flow checking algorithm
        #[arg(long, value_enum)]
        cfc: Option<CfcChoice>,

        /// Alternating memory map for duplicated data
        #[arg(long)]
        alternate_memmap: bool,

        /// Directory holding the compiled-function CSVs
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Signature-assignment seed
        #[arg(long)]
        seed: Option<u64>,

        /// Print the hardened module as text to stderr
        #[arg(long)]
        emit_ir: bool,
    },

    /// List the registered pass names
    Passes,

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("aspisc=info".parse().expect("static directive")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Harden {
            input,
            output,
            passes,
            config,
            cfc,
            alternate_memmap,
            state_dir,
            seed,
            emit_ir,
        } => {
            let result = harden(
                &input,
                output,
                passes,
                config,
                cfc,
                alternate_memmap,
                state_dir,
                seed,
                emit_ir,
            );
            if let Err(e) = result {
                eprintln!("error: {e}");
                process::exit(1);
            }
        }
        Commands::Passes => {
            for p in PassKind::ALL {
                println!("{}", p.name());
            }
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn harden(
    input: &PathBuf,
    output: Option<PathBuf>,
    passes: Option<String>,
    config: Option<PathBuf>,
    cfc: Option<CfcChoice>,
    alternate_memmap: bool,
    state_dir: Option<PathBuf>,
    seed: Option<u64>,
    emit_ir: bool,
) -> Result<(), String> {
    let mut cfg = match config {
        Some(path) => {
            let text = fs::read_to_string(&path)
                .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            HardeningConfig::from_toml(&text)?
        }
        None => HardeningConfig::default(),
    };
    if alternate_memmap {
        cfg.alternate_memmap = true;
    }
    if let Some(choice) = cfc {
        cfg.cfc = match choice {
            CfcChoice::None => CfcAlgorithm::None,
            CfcChoice::Rasm => CfcAlgorithm::Rasm,
            CfcChoice::Racfed => CfcAlgorithm::Racfed,
        };
    }
    if let Some(dir) = state_dir {
        cfg.state_dir = dir;
    }
    if let Some(seed) = seed {
        cfg.seed = seed;
    }

    let text = fs::read_to_string(input)
        .map_err(|e| format!("failed to read {}: {e}", input.display()))?;
    let mut module: Module =
        serde_json::from_str(&text).map_err(|e| format!("failed to parse module: {e}"))?;

    let pipeline = match passes {
        Some(spec) => Pipeline::parse(&spec).map_err(|e| e.to_string())?,
        None => Pipeline::new(canonical_passes(&cfg)),
    };
    pipeline
        .run(&mut module, &cfg)
        .map_err(|e| e.to_string())?;

    if emit_ir {
        eprintln!("{module}");
    }

    let out_path = output.unwrap_or_else(|| input.with_extension("hardened.json"));
    let serialized =
        serde_json::to_string(&module).map_err(|e| format!("failed to serialize module: {e}"))?;
    fs::write(&out_path, serialized)
        .map_err(|e| format!("failed to write {}: {e}", out_path.display()))?;
    Ok(())
}
