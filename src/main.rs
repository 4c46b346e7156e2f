use termai::chatbot::{hash_token, ChatError, FallbackResponder, Responder, ResponseGenerator};
use termai::chatlog::ChatLogger;
use termai::config::AssistantConfig;
use termai::gpt::MiniGPT;
use termai::relay::Relay;
use termai::text::tokenize;

use clap::{Args, Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

// --- CLI Commands ---

#[derive(Parser, Debug)]
#[command(author, version, about = "TermChat assistant core", long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    #[arg(long, global = true, help = "JSON config file; flags below override it")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Seed for weight initialization")]
    seed: Option<u64>,
    #[arg(long, global = true, help = "Token space size; chat commands also need that many configured replies")]
    vocab_size: Option<usize>,
    #[arg(long, global = true, help = "Append answered turns to this JSON-lines file")]
    log_path: Option<PathBuf>,
    #[arg(long, global = true, default_value = "warn", help = "Log level when RUST_LOG is unset")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print one reply to a message
    Ask {
        /// The message to answer
        message: String,
    },
    /// Interactive chat on stdin; type `quit` to leave
    Chat,
    /// Answer JSON chat payloads read line by line from stdin
    Relay,
    /// Run the miniature transformer over a message
    Gpt {
        /// Text whose words are hashed into token ids
        message: String,
        #[arg(long, help = "Write the model weights to this file")]
        save: Option<PathBuf>,
    },
}

// --- Helper Functions ---

fn setup_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Defaults, then the optional JSON file, then flags. Each command validates
/// what it uses: the chat commands need a matching reply vocabulary, `gpt` does not.
fn load_config(common: &CommonArgs) -> Result<AssistantConfig, ChatError> {
    let mut config = match &common.config {
        Some(path) => {
            info!(path = %path.display(), "loading config");
            AssistantConfig::from_json_file(path)?
        }
        None => AssistantConfig::default(),
    };
    if let Some(seed) = common.seed {
        config.seed = Some(seed);
    }
    if let Some(vocab_size) = common.vocab_size {
        config.vocab_size = vocab_size;
    }
    if let Some(path) = &common.log_path {
        config.log_path = Some(path.clone());
    }
    debug!(?config, "effective configuration");
    Ok(config)
}

fn build_responder(config: &AssistantConfig) -> Result<impl Responder, ChatError> {
    let generator = ResponseGenerator::from_config(config)?;
    let responder = FallbackResponder::local(generator);
    Ok(match &config.log_path {
        Some(path) => responder.with_logger(ChatLogger::new(path.clone())),
        None => responder,
    })
}

// --- Main Logic ---

fn main() -> Result<(), ChatError> {
    let cli = Cli::parse();
    setup_logging(&cli.common.log_level);
    let config = load_config(&cli.common)?;

    match cli.command {
        Command::Ask { message } => {
            let responder = build_responder(&config)?;
            println!("{}", responder.respond(&message)?);
        }
        Command::Chat => run_chat(&config)?,
        Command::Relay => run_relay(&config)?,
        Command::Gpt { message, save } => run_gpt(&config, &message, save)?,
    }
    Ok(())
}

// --- Chat Loop ---
fn run_chat(config: &AssistantConfig) -> Result<(), ChatError> {
    let responder = build_responder(config)?;
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    print!("> ");
    stdout.flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        let message = line.trim();
        if message.eq_ignore_ascii_case("quit") {
            break;
        }
        if !message.is_empty() {
            println!("{}: {}", config.bot_name, responder.respond(message)?);
        }
        print!("> ");
        stdout.flush()?;
    }
    println!();
    Ok(())
}

// --- Relay Loop ---
fn run_relay(config: &AssistantConfig) -> Result<(), ChatError> {
    let relay = Relay::from_config(build_responder(config)?, config);
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match relay.handle(line.as_bytes()) {
            Ok(Some(reply)) => {
                stdout.write_all(&reply)?;
                stdout.write_all(b"\n")?;
                stdout.flush()?;
            }
            Ok(None) => {}
            Err(ChatError::Json(e)) => warn!(error = %e, "skipping malformed payload"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// --- Transformer Demo ---
fn run_gpt(config: &AssistantConfig, message: &str, save: Option<PathBuf>) -> Result<(), ChatError> {
    config.validate_model()?;
    let vocab = NonZeroUsize::new(config.vocab_size)
        .ok_or_else(|| ChatError::Configuration("vocab_size must be positive".into()))?;
    let mut rng = config.rng();
    let gpt = MiniGPT::new(&mut rng, config.vocab_size, config.embed_size, config.num_layers)?;
    info!(params = gpt.num_params(), "model initialized");

    let tokens: Vec<usize> = tokenize(message)
        .iter()
        .map(|word| hash_token(word, vocab))
        .collect();
    if tokens.is_empty() {
        return Err(ChatError::Configuration("message contains no words".into()));
    }

    let logits = gpt.next_token_logits(&tokens)?;
    let next = logits
        .argmax()
        .ok_or_else(|| ChatError::Configuration("model produced no logits".into()))?;
    println!("tokens: {tokens:?}");
    println!("next token: {next}");
    println!("parameters: {}", gpt.num_params());

    if let Some(path) = save {
        gpt.state().save(&path)?;
        println!("saved model state to {}", path.display());
    }
    Ok(())
}
