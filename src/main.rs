use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use crossterm::style::Stylize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::fmt::SubscriberBuilder;
use vertex_claude::cassette;
use vertex_claude::config::{Env, ProcessEnv, SettingsOverrides, VertexSettings, PROJECT_ENV_VARS};
use vertex_claude::llm::recording::PlaybackState;
use vertex_claude::llm::{
    find_model, register_models, Attachment, ClaudeOptions, Prompt, StreamingCallback,
    StreamingChunk, TokenManager, VertexClaude,
};
use vertex_claude::setup::{Reporter, SetupChecker};
use vertex_claude::utils::{DefaultCommandExecutor, StdinPrompter};

#[derive(Parser, Debug)]
#[command(version, about = "Claude models on Google Cloud Vertex AI", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the available models
    Models,

    /// Send a prompt to a model
    Prompt(PromptArgs),

    /// Check gcloud, credentials, project, region and the Vertex AI API
    Setup,

    /// Decompress gzip response bodies in YAML cassettes
    DecompressCassettes {
        /// Files or glob patterns, e.g. 'tests/**/*.yaml'
        #[arg(required = true)]
        patterns: Vec<String>,
    },
}

#[derive(clap::Args, Debug)]
struct PromptArgs {
    /// Prompt text
    prompt: String,

    /// Model to use
    #[arg(short = 'm', long, default_value = "vertex-4.5-sonnet")]
    model: String,

    /// System prompt
    #[arg(short = 's', long)]
    system: Option<String>,

    /// Attach a file or URL (repeatable)
    #[arg(short = 'a', long = "attach")]
    attachments: Vec<String>,

    /// JSON schema (inline JSON or a path to a file) for structured output
    #[arg(long)]
    schema: Option<String>,

    /// Model option, e.g. `-o temperature 0.5` (repeatable)
    #[arg(
        short = 'o',
        long = "option",
        num_args = 2,
        value_names = ["KEY", "VALUE"],
        action = ArgAction::Append
    )]
    options: Vec<String>,

    /// Wait for the complete response instead of streaming
    #[arg(long)]
    no_stream: bool,

    /// Google Cloud project ID
    #[arg(long)]
    project: Option<String>,

    /// Vertex AI region
    #[arg(long)]
    region: Option<String>,

    /// Record API responses to a file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Play back a recorded session from a file
    #[arg(long)]
    playback: Option<PathBuf>,

    /// Fast playback mode - ignore chunk timing when playing recordings
    #[arg(long)]
    fast_playback: bool,

    /// Print the raw response JSON after the text
    #[arg(long)]
    json: bool,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        "vertex_claude=debug,info"
    } else {
        "vertex_claude=info,warn"
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    // stdout is reserved for model output
    let subscriber: SubscriberBuilder<_, _, _, fn() -> Box<dyn io::Write + Send>> =
        subscriber.with_writer(|| Box::new(std::io::stderr()) as Box<dyn io::Write + Send>);

    subscriber.init();
}

fn list_models() {
    for model in register_models() {
        let mut features = Vec::new();
        if model.supports_images {
            features.push("images");
        }
        if model.supports_pdf {
            features.push("pdf");
        }
        if model.supports_thinking {
            features.push("thinking");
        }
        println!(
            "{} ({}) [{}]",
            model.model_id.bold(),
            model.vertex_name,
            features.join(", ")
        );
    }
}

fn load_attachment(source: &str) -> Result<Attachment> {
    if source.starts_with("http://") || source.starts_with("https://") {
        Ok(Attachment::from_url(source))
    } else {
        Attachment::from_path(Path::new(source))
    }
}

fn load_schema(schema: &str) -> Result<serde_json::Value> {
    let path = Path::new(schema);
    let text = if path.is_file() {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema {}", path.display()))?
    } else {
        schema.to_string()
    };
    serde_json::from_str(&text).context("Schema is not valid JSON")
}

fn print_chunk(chunk: &StreamingChunk) -> Result<()> {
    match chunk {
        StreamingChunk::Text(text) => {
            let mut stdout = io::stdout().lock();
            write!(stdout, "{text}")?;
            stdout.flush()?;
        }
        StreamingChunk::Thinking(text) => {
            eprint!("{}", text.as_str().dim());
        }
        StreamingChunk::RateLimit { seconds_remaining } => {
            eprintln!(
                "{}",
                format!("Rate limited, retrying in {seconds_remaining}s...").yellow()
            );
        }
        StreamingChunk::InputJson { .. } => {}
    }
    Ok(())
}

async fn run_prompt(args: PromptArgs) -> Result<()> {
    let model = find_model(&args.model)
        .with_context(|| format!("Unknown model '{}'. Run `vertex-claude models`", args.model))?;

    let pairs: Vec<(&str, &str)> = args
        .options
        .chunks(2)
        .filter_map(|pair| match pair {
            [key, value] => Some((key.as_str(), value.as_str())),
            _ => None,
        })
        .collect();
    let options = ClaudeOptions::from_pairs(&pairs)?;

    let mut prompt = Prompt::new(args.prompt).with_options(options);
    if let Some(system) = args.system {
        prompt = prompt.with_system(system);
    }
    for source in &args.attachments {
        prompt = prompt.with_attachment(load_attachment(source)?);
    }
    if let Some(schema) = &args.schema {
        prompt = prompt.with_schema(load_schema(schema)?);
    }

    let env = ProcessEnv;
    let mut overrides = SettingsOverrides {
        project_id: args.project,
        region: args.region,
        ..Default::default()
    };
    if args.playback.is_some() && overrides.project_id.is_none() {
        overrides.project_id = env
            .first_of(PROJECT_ENV_VARS)
            .or_else(|| Some("playback".to_string()));
    }
    let settings = VertexSettings::resolve(overrides, &env)?;
    let token_manager = Arc::new(TokenManager::from_settings(&settings, &env));
    debug!("Using {} credentials", token_manager.source_name());

    let mut client = VertexClaude::new(model, settings, token_manager);
    if let Some(path) = args.record {
        client = client.with_recorder(path);
    }
    if let Some(path) = args.playback {
        client = client.with_playback(PlaybackState::from_file(path, args.fast_playback)?);
    }

    let callback: Option<StreamingCallback> = if args.no_stream {
        None
    } else {
        Some(Box::new(print_chunk))
    };

    let response = client.prompt(prompt, None, callback.as_ref()).await?;
    if callback.is_none() {
        print!("{}", response.text());
    }
    println!();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response.response_json)?);
    }
    debug!(
        "Usage: {} input, {} output tokens",
        response.input_tokens(),
        response.output_tokens()
    );
    Ok(())
}

async fn run_setup() -> Result<i32> {
    let mut checker = SetupChecker::new(
        Arc::new(DefaultCommandExecutor),
        Box::new(StdinPrompter),
        Box::new(ProcessEnv),
        Reporter::stdout(),
    );
    checker.run().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);
    dotenv::dotenv().ok();

    match args.command {
        Command::Models => list_models(),
        Command::Prompt(prompt_args) => run_prompt(prompt_args).await?,
        Command::Setup => {
            let code = run_setup().await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Command::DecompressCassettes { patterns } => {
            cassette::run(&patterns, &mut StdinPrompter, &mut Reporter::stdout())?;
        }
    }

    Ok(())
}
