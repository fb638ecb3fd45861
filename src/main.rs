use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use voxchat_asr::{RecognitionEvent, RecognitionStreamAdapter, RecognizerRegistry};
use voxchat_audio::{AudioCaptureSession, DeviceManager};
use voxchat_chat::{ChatClient, ChatEvent};
use voxchat_core::{AppConfig, ConversationTurn};

#[derive(Parser)]
#[command(name = "voxchat", about = "Ask a chat model by voice")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip recognition and send this text instead
    #[arg(short, long)]
    text: Option<String>,

    /// Print the available input devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from_file(&cli.config)
        .with_context(|| format!("failed to load config from {:?}", cli.config))?;

    let env_filter = EnvFilter::try_new(&config.general.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::Registry::default().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false),
    );
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    if cli.list_devices {
        let devices = DeviceManager::new()
            .list_input_devices()
            .context("failed to list input devices")?;
        for (name, _) in devices {
            println!("{}", name);
        }
        return Ok(());
    }

    tracing::info!("voxchat starting");

    let question = match cli.text {
        Some(text) => text,
        None => listen(&config).await?,
    };
    if question.trim().is_empty() {
        bail!("nothing was recognized");
    }
    tracing::info!(chars = question.len(), "question ready");

    ask(&config, &question).await
}

/// Run one recognition session and return the transcript.
async fn listen(config: &AppConfig) -> Result<String> {
    let capture = Arc::new(AudioCaptureSession::with_cpal(&config.capture));
    let registry = RecognizerRegistry::new();
    let adapter = RecognitionStreamAdapter::from_config(config, &registry, capture)
        .await
        .with_context(|| format!("failed to set up ASR engine '{}'", config.asr.engine))?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    adapter.set_callback(tx);
    adapter.start().context("failed to start recognition")?;
    eprintln!("listening, press Ctrl-C to finish");

    let mut finals: Vec<String> = Vec::new();
    let mut partial = String::new();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(RecognitionEvent::Result(result)) => {
                    tracing::debug!(is_final = result.is_final, "ASR: {}", result.text);
                    if result.is_final {
                        finals.push(result.text);
                        partial.clear();
                    } else {
                        partial = result.text;
                    }
                }
                Some(RecognitionEvent::AutoStop) | None => break,
                Some(RecognitionEvent::Error(message)) => {
                    adapter.stop();
                    bail!("recognition failed: {}", message);
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    adapter.stop();

    if !partial.is_empty() {
        finals.push(partial);
    }
    Ok(finals.join(""))
}

/// Stream the model's answer to `question` onto stdout.
async fn ask(config: &AppConfig, question: &str) -> Result<()> {
    let mut client = ChatClient::new(&config.chat, config.messages.clone())
        .context("failed to create chat client")?;
    let mut events = client
        .take_event_receiver()
        .context("chat event receiver already taken")?;

    let mut turns = Vec::new();
    if let Some(prompt) = config.chat.system_prompt.as_deref() {
        turns.push(ConversationTurn::system(prompt));
    }
    turns.push(ConversationTurn::user(question));
    eprintln!("> {}", question);

    client
        .send(&turns, &client.default_options())
        .context("failed to send completion request")?;

    let mut stdout = std::io::stdout();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                client.stop();
                continue;
            }
        };
        match event {
            Some(ChatEvent::Delta(text)) => {
                print!("{}", text);
                stdout.flush().ok();
            }
            Some(ChatEvent::FunctionCall(calls)) => {
                println!();
                for call in calls {
                    println!("[tool call {}] {}({})", call.tool_id, call.name, call.arguments);
                }
                break;
            }
            Some(ChatEvent::Finished(completed)) => {
                println!();
                if !completed {
                    tracing::info!("answer cancelled");
                }
                break;
            }
            Some(ChatEvent::Error(message)) => {
                println!();
                bail!("{}", message);
            }
            None => break,
        }
    }
    Ok(())
}
