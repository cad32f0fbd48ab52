use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use slang::{
    Generics, Library, Operator, OperatorDef, Properties, Value, build, builtin, config::Config,
    logger::init_tracing, schema,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "slang",
    about = "Build, validate and run flow-based operator graphs",
    version
)]
struct Cli {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// .env file read before the SLANG_* variables
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    /// Directory of operator definitions, overrides SLANG_LIBRARY_DIR
    #[arg(long, global = true)]
    library_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build and compile a definition without running it
    Validate { file: PathBuf },

    /// Run a definition once per input
    Run(RunArgs),

    /// Emit the JSON Schema of definition files
    Schema {
        /// Write to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    file: PathBuf,

    /// JSON value pushed into the main service, one result is printed per input
    #[arg(long = "input", required = true)]
    inputs: Vec<String>,

    /// JSON object binding generic names to type descriptors
    #[arg(long)]
    generics: Option<String>,

    /// JSON object of property values
    #[arg(long)]
    properties: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut config, env_file) = Config::from_env(Some(cli.env_file.as_path()));
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(dir) = cli.library_dir {
        config.library_dir = Some(dir);
    }
    init_tracing(&config.log_config())?;
    env_file.log();

    match cli.command {
        Commands::Validate { file } => {
            let library = library(&config)?;
            let operator = assemble(&file, &Generics::new(), Properties::new(), &library)?;
            println!(
                "✅ {} is valid ({} operators after compile).",
                file.display(),
                operator.children().len()
            );
            Ok(())
        }
        Commands::Run(args) => {
            let library = library(&config)?;
            let generics: Generics = match &args.generics {
                Some(s) => serde_json::from_str(s).context("invalid --generics")?,
                None => Generics::new(),
            };
            let properties = match &args.properties {
                Some(s) => parse_properties(s)?,
                None => Properties::new(),
            };
            let inputs = args
                .inputs
                .iter()
                .map(|s| serde_json::from_str::<serde_json::Value>(s).map(Value::from))
                .collect::<Result<Vec<_>, _>>()
                .context("invalid --input")?;

            let operator = assemble(&args.file, &generics, properties, &library)?;
            run(operator, inputs).await
        }
        Commands::Schema { out } => {
            match out {
                Some(path) => {
                    schema::write_schema(&path)?;
                    println!("Schema written to {}", path.display());
                }
                None => println!("{}", schema::definition_schema()?),
            }
            Ok(())
        }
    }
}

fn library(config: &Config) -> anyhow::Result<Arc<Library>> {
    let library = Library::new();
    builtin::register(&library);
    if let Some(dir) = &config.library_dir {
        let loaded = library
            .load_dir(dir)
            .with_context(|| format!("could not load library {}", dir.display()))?;
        info!(dir = %dir.display(), loaded, "library loaded");
    }
    Ok(library)
}

fn parse_properties(s: &str) -> anyhow::Result<Properties> {
    let raw: HashMap<String, serde_json::Value> =
        serde_json::from_str(s).context("invalid --properties")?;
    Ok(raw.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
}

/// Loads, builds and compiles `file`; the result is ready to start.
fn assemble(
    file: &Path,
    generics: &Generics,
    properties: Properties,
    library: &Library,
) -> anyhow::Result<Arc<Operator>> {
    let def = OperatorDef::load(file).with_context(|| format!("could not load {}", file.display()))?;
    def.validate()?;
    if def.operators.is_empty() {
        bail!("{} has no operators to run", file.display());
    }
    let name = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("main")
        .to_string();

    let operator = build(&name, &def, generics, properties, library)?;
    let eliminated = operator.compile();
    operator.correctly_compiled()?;
    info!(operator = %name, eliminated, "compiled");
    Ok(operator)
}

async fn run(operator: Arc<Operator>, inputs: Vec<Value>) -> anyhow::Result<()> {
    operator.main().out_port().bufferize();
    operator.start()?;

    let worker = operator.clone();
    let results = tokio::task::spawn_blocking(move || {
        let input = worker.main().in_port();
        let output = worker.main().out_port();
        inputs
            .into_iter()
            .map(|value| {
                input.push(value)?;
                output.pull()
            })
            .collect::<Result<Vec<_>, _>>()
    })
    .await?;

    operator.stop();
    operator.wait().await;

    match results {
        Ok(results) => {
            for result in results {
                println!("{}", result.to_json());
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "run failed");
            bail!(e);
        }
    }
}
