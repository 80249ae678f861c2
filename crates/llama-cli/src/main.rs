use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use llama_cli::{describe, embed, generate, CliError, StreamWriter};
use llama_runtime::ReferenceBackend;
use llama_serve::{Client, Model, ServeConfig};
use tracing_subscriber::EnvFilter;

/// llama-serve command-line front end
#[derive(Parser)]
#[command(name = "llama-cli", version = llama_serve::VERSION)]
struct Cli {
    /// JSON config file; missing fields keep their defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Load a model and print its metadata.
    Info {
        /// Model file.
        model: PathBuf,
    },
    /// Stream a reply to a prompt.
    Generate {
        /// Model file.
        model: PathBuf,

        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        /// Optional system prompt.
        #[arg(short, long)]
        system: Option<String>,

        /// Stop after this many tokens.
        #[arg(short, long)]
        max_tokens: Option<u32>,
    },
    /// Print one embedding per text as JSON.
    Embed {
        /// Model file.
        model: PathBuf,

        /// Texts to embed.
        #[arg(required = true)]
        texts: Vec<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => ServeConfig::from_path(path)?,
        None => ServeConfig::default(),
    };
    let mut model = Model::new(Arc::new(ReferenceBackend::new()));

    match cli.command {
        Command::Info { model: path } => {
            model.load_with(&path, &config.model)?;
            wait_loaded(&mut model)?;
            print!("{}", describe(&model));
        }
        Command::Generate {
            model: path,
            prompt,
            system,
            max_tokens,
        } => {
            model.load_with(&path, &config.model)?;
            wait_loaded(&mut model)?;
            let client = Client::new(StreamWriter::new(io::stdout()));
            let summary = generate(
                &model,
                &config,
                system.as_deref(),
                &prompt,
                max_tokens,
                &client,
            )?;
            println!();
            tracing::info!(
                prompt_tokens = summary.prompt_tokens,
                generated = summary.generated_tokens,
                finish = ?summary.finish,
                "done"
            );
        }
        Command::Embed { model: path, texts } => {
            model.load_with(&path, &config.model)?;
            wait_loaded(&mut model)?;
            let vectors = embed(&model, &config, &texts)?;
            println!("{}", serde_json::to_string(&vectors)?);
        }
    }

    model.destroy_sync()?;
    Ok(())
}

/// Poll the model until the load settles.
fn wait_loaded(model: &mut Model) -> Result<(), CliError> {
    while model.state() == llama_serve::ModelState::Initializing {
        model.update();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    match model.last_fail() {
        Some(failure) => Err(llama_serve::ModelError::InitFailed(failure).into()),
        None => Ok(()),
    }
}
