//! FilterChat - local chat generation with a safety gate
//!
//! Reads one JSON request per line on stdin and writes one JSON line per
//! response on stdout:
//!
//! - `generate`: a `GenerationRequest` in, a `GenerationResult` out
//! - `stream`: a `GenerationRequest` in, one line per token and a final `"[DONE]"`
//! - `classify`: `{"text": ...}` in, a `SafetyVerdict` out
//! - `gate`: `{"messages": [...]}` in, a `GatedReply` out

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use filterchat::config::load_settings;
use filterchat::inference::{streaming, BackendRegistry, Generator};
use filterchat::safety::{SafetyClassifier, SafetyGate};
use filterchat::types::{GenerationRequest, Message};

#[derive(Debug, Clone, Copy)]
enum Mode {
    Generate,
    Stream,
    Classify,
    Gate,
}

impl Mode {
    fn parse(arg: Option<&str>) -> Option<Self> {
        match arg.unwrap_or("generate") {
            "generate" => Some(Mode::Generate),
            "stream" => Some(Mode::Stream),
            "classify" => Some(Mode::Classify),
            "gate" => Some(Mode::Gate),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClassifyInput {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GateInput {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct ErrorLine {
    error: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("filterchat=info".parse()?))
        .init();

    let arg = std::env::args().nth(1);
    let Some(mode) = Mode::parse(arg.as_deref()) else {
        eprintln!("usage: filterchat [generate|stream|classify|gate]");
        std::process::exit(2);
    };

    info!(
        "Starting FilterChat v{} in {:?} mode",
        env!("CARGO_PKG_VERSION"),
        mode
    );

    let settings = Arc::new(load_settings());
    let registry = Arc::new(BackendRegistry::new(&settings));
    let generator = Generator::new(Arc::clone(&registry), Arc::clone(&settings));
    let classifier = SafetyClassifier::new(generator.clone());
    let gate = SafetyGate::new(classifier.clone(), settings.reply_policy);

    if settings.eager_init {
        if let Err(e) = registry.initialize_default().await {
            warn!("Eager initialization failed, will retry on first request: {e}");
        }
        for status in registry.status().await {
            info!(
                "Loaded {} from {} (adapter: {:?})",
                status.kind, status.model_ref, status.adapter
            );
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match mode {
            Mode::Generate => {
                let response = match serde_json::from_str::<GenerationRequest>(&line) {
                    Ok(request) => generator
                        .generate_request(&request)
                        .await
                        .map_err(|e| e.to_string())
                        .and_then(to_json),
                    Err(e) => Err(format!("Invalid payload: {e}")),
                };
                write_response(&mut stdout, response).await?;
            }
            Mode::Stream => match serde_json::from_str::<GenerationRequest>(&line) {
                Ok(request) => {
                    let mut tokens =
                        Box::pin(streaming::stream_request(generator.clone(), request));
                    while let Some(token) = tokens.next().await {
                        write_line(&mut stdout, &serde_json::to_string(&token.into_wire())?)
                            .await?;
                    }
                }
                Err(e) => {
                    write_response(&mut stdout, Err(format!("Invalid payload: {e}"))).await?
                }
            },
            Mode::Classify => {
                let response = match serde_json::from_str::<ClassifyInput>(&line) {
                    Ok(input) => classifier
                        .classify(&input.text)
                        .await
                        .map_err(|e| e.to_string())
                        .and_then(to_json),
                    Err(e) => Err(format!("Invalid payload: {e}")),
                };
                write_response(&mut stdout, response).await?;
            }
            Mode::Gate => {
                let response = match serde_json::from_str::<GateInput>(&line) {
                    Ok(input) => gate
                        .respond(&input.messages)
                        .await
                        .map_err(|e| e.to_string())
                        .and_then(to_json),
                    Err(e) => Err(format!("Invalid payload: {e}")),
                };
                write_response(&mut stdout, response).await?;
            }
        }
    }

    Ok(())
}

fn to_json<T: Serialize>(value: T) -> Result<String, String> {
    serde_json::to_string(&value).map_err(|e| e.to_string())
}

async fn write_response(
    stdout: &mut Stdout,
    response: Result<String, String>,
) -> std::io::Result<()> {
    match response {
        Ok(json) => write_line(stdout, &json).await,
        Err(message) => {
            error!("Request failed: {message}");
            let json = serde_json::to_string(&ErrorLine { error: message })?;
            write_line(stdout, &json).await
        }
    }
}

async fn write_line(stdout: &mut Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
