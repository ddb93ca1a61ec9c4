//! modseal CLI - thin wrappers over the pipeline and the loader

use anyhow::Context;
use clap::{Parser, Subcommand};
use modseal::{
    KeyId, KeyMaterial, KeySource, Pipeline, RuntimeLoader, SealConfig, CONTAINER_EXTENSION,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "modseal", about = "Protected native-module distribution")]
#[command(version)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a source unit into the output directory
    Compile {
        /// Source file
        source: PathBuf,
    },

    /// Encrypt a compiled artifact into a container
    Encrypt {
        /// Compiled artifact file
        artifact: PathBuf,
        /// Key label; the container records its derived identifier
        key_id: String,
    },

    /// Compile and encrypt in one step
    Build {
        /// Source file
        source: PathBuf,
        /// Key label
        #[arg(long, default_value = "default")]
        key_id: String,
    },

    /// Decrypt a container and load the module into this process
    Run {
        /// Container file (.sealed)
        container: PathBuf,
        /// Module name to register under (default: container file stem)
        #[arg(long)]
        name: Option<String>,
        /// Entry-point symbol to invoke after loading
        #[arg(long)]
        entry: Option<String>,
    },

    /// Generate a fresh key for the embedded strategy
    Keygen {
        /// Key label to derive the identifier from
        #[arg(long, default_value = "default")]
        label: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(&cli) {
        // Error messages carry diagnostics only; never key material or
        // decrypted plaintext.
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if verbose { "debug" } else { "info" })
        });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SealConfig> {
    match path {
        Some(path) => {
            SealConfig::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(SealConfig::default()),
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;

    match &cli.command {
        Command::Compile { source } => {
            let artifact = Pipeline::new(config)?.compile(source)?;
            println!(
                "compiled {} for {} ({} bytes)",
                artifact.name,
                artifact.platform,
                artifact.len()
            );
        }

        Command::Encrypt { artifact, key_id } => {
            let container_path = Pipeline::new(config)?.encrypt_file(artifact, key_id)?;
            println!("sealed {}", container_path.display());
        }

        Command::Build { source, key_id } => {
            let report = Pipeline::new(config)?.build(source, key_id)?;
            println!(
                "built {} -> {} ({} -> {} bytes, key {})",
                report.unit,
                report.container_path.display(),
                report.artifact_size,
                report.container_size,
                report.key_id
            );
        }

        Command::Run {
            container,
            name,
            entry,
        } => {
            let module_name = match name {
                Some(name) => name.clone(),
                None => default_module_name(container)?,
            };

            let keys = KeySource::from_config(&config.key_source)?;
            let mut loader = RuntimeLoader::new(keys);
            if let Some(dir) = &config.staging_dir {
                loader = loader.with_staging_dir(dir);
            }

            let module = loader.load_file(container, &module_name)?;
            println!("loaded {}", module.name());

            if let Some(symbol) = entry {
                let status = module.call_entry(symbol)?;
                println!("{} returned {}", symbol, status);
                if status != 0 {
                    std::process::exit(status);
                }
            }
        }

        Command::Keygen { label } => {
            let key = KeyMaterial::generate(KeyId::from_label(label));
            println!("key id:  {}", key.id());
            println!("key:     {}", key.export_base64());
            println!();
            println!("put the key under {{\"key_source\": {{\"strategy\": \"embedded\", \"key\": ...}}}}");
        }
    }

    Ok(())
}

/// Module name from a container path: the file stem, with a trailing
/// `.sealed` stripped if the file was named `<unit>.sealed.<anything>`.
fn default_module_name(container: &Path) -> anyhow::Result<String> {
    let stem = container
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| {
            s.strip_suffix(&format!(".{}", CONTAINER_EXTENSION))
                .unwrap_or(s)
                .to_string()
        })
        .filter(|s| !s.is_empty());
    stem.ok_or_else(|| anyhow::anyhow!("cannot derive a module name from {}", container.display()))
}
