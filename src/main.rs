//! wen - ask a hosted LLM a question from the terminal.
//!
//! The question is sent to a chat-completions or messages style API and the
//! answer is printed with its color/style tags rendered as ANSI escapes,
//! either all at once or as the response streams in.

mod config;
mod exchange;
mod llm;
mod markup;
mod request;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use exchange::Exchange;
use request::NormalizedRequest;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use transport::HttpTransport;

#[derive(Parser)]
#[command(name = "wen")]
#[command(author, version, about = "Ask an LLM a question and get a terminal-styled answer")]
struct Cli {
    /// The question; all words are joined with single spaces
    #[arg(value_name = "QUESTION", required = true, trailing_var_arg = true)]
    question: Vec<String>,

    /// Read configuration from this file only
    #[arg(short = 'c', long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Wait for the full answer instead of streaming it
    #[arg(long)]
    no_stream: bool,

    /// Log request details to stderr
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Logs go to stderr so they never mix with the answer.
fn init_logging(verbose: bool) {
    let default = if verbose {
        "wen=debug,reqwest=warn"
    } else {
        "wen=warn,reqwest=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = config::Config::load(cli.config.as_deref())?;
    if cli.no_stream {
        config.stream = false;
    }

    let api_key = config.api_key()?;
    let provider = llm::create_provider(&config);
    tracing::info!(
        provider = provider.name(),
        model = %config.model,
        stream = config.stream,
        "config loaded"
    );

    let transport = HttpTransport::new(
        config.api_url.clone(),
        api_key.clone(),
        provider.extra_headers(&api_key),
        config.timeout.map(Duration::from_secs),
    )
    .context("Failed to create HTTP client")?;

    let question = cli.question.join(" ");
    let request = NormalizedRequest::from_config(&config, question);

    let start = Instant::now();
    let mut stdout = std::io::stdout();
    let answer = Exchange::new(provider, transport)
        .execute(&request, &mut stdout)
        .await
        .context("Request to AI failed")?;

    // Streaming output is already on screen.
    if !request.streaming {
        writeln!(stdout, "{}", markup::render(&answer))?;
    }

    let elapsed = start.elapsed().as_secs_f64();
    writeln!(
        stdout,
        "{}",
        markup::render(&format!("\n<bold>耗时: {:.2} 秒</bold>", elapsed))
    )?;
    stdout.flush()?;

    Ok(())
}
