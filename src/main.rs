use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use handtalk::capture::{CaptureEvent, ConsoleCapture, SpeechCapture};
use handtalk::chat::{Chat, DialogueResponder};
use handtalk::config::{CaptureBackend, Config, GestureConfig, PlaybackBackend};
use handtalk::frames;
use handtalk::gesture::GestureDetector;
use handtalk::language::{ChatLanguageDetector, LanguageDetector};
use handtalk::llm::ApiClient;
use handtalk::session::Session;
use handtalk::state::{RuntimeState, SharedState};
use handtalk::tts::{ConsolePlayback, SpeechPlayback};
use handtalk::ui;

#[derive(Parser)]
#[command(name = "handtalk", about = "Hands-free spoken dialogue with a fist-grab trigger")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Type instead of speaking and read replies instead of hearing them
    #[arg(long, global = true)]
    console: bool,

    /// Keypoint frames (JSON lines) from a file, or `-` for stdin
    #[arg(long, global = true, value_name = "FILE|-")]
    keypoints: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Live dialogue loop (default)
    Run,
    /// Classify keypoint frames and print grab events
    Gestures {
        /// JSON-lines file, or `-` for stdin
        input: Option<String>,
    },
    /// Detect the language of one utterance
    Detect { text: String },
    /// One language detection and reply, printed instead of spoken
    Ask { text: String },
}

#[hotpath::main]
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("handtalk=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("handtalk=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "failed to load config");
            return Err(e.into());
        }
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_dialogue(config, cli.console, cli.keypoints).await,
        Command::Gestures { input } => {
            let source = input.or(cli.keypoints).unwrap_or_else(|| "-".to_string());
            run_gestures(&config.gesture, &source).await
        }
        Command::Detect { text } => {
            let detector = language_detector(&config)?;
            println!("{}", detect(&detector, &config, &text).await);
            Ok(())
        }
        Command::Ask { text } => {
            let detector = language_detector(&config)?;
            let language = detect(&detector, &config, &text).await;
            let chat = Chat::new(
                ApiClient::new(&config.llm)?,
                &config.name,
                config.llm.history_turns,
            );
            let reply = chat.reply(&text).await?;
            ui::show_reply(&reply, &language);
            Ok(())
        }
    }
}

fn language_detector(config: &Config) -> anyhow::Result<ChatLanguageDetector> {
    Ok(ChatLanguageDetector::new(
        ApiClient::new(&config.llm)?,
        &config.turn.default_language,
    ))
}

/// Detection with the same fallback the controller applies
async fn detect(detector: &ChatLanguageDetector, config: &Config, text: &str) -> String {
    detector.detect_language(text).await.unwrap_or_else(|e| {
        warn!(error = %e, "language detection failed");
        config.turn.default_language.clone()
    })
}

async fn run_dialogue(
    config: Config,
    console: bool,
    keypoints: Option<String>,
) -> anyhow::Result<()> {
    let console_capture = console || config.speech.capture == CaptureBackend::Console;
    if console_capture && keypoints.as_deref() == Some("-") {
        bail!("stdin cannot carry both typed input and keypoint frames; pass a keypoint file");
    }

    let client = ApiClient::new(&config.llm)?;
    let state = RuntimeState::new();
    let (inputs_tx, inputs_rx) = flume::unbounded();

    let capture = build_capture(&config, console, &client, inputs_tx.clone())?;
    let playback = build_playback(&config, console, &client);
    let detector = Arc::new(ChatLanguageDetector::new(
        client.clone(),
        &config.turn.default_language,
    ));
    let responder = Arc::new(Chat::new(client, &config.name, config.llm.history_turns));

    if let Some(source) = keypoints {
        spawn_gestures(&config.gesture, &source, Arc::clone(&state), inputs_tx)?;
    }

    let (observer_tx, observer_rx) = flume::unbounded();
    tokio::spawn(async move {
        while let Ok(event) = observer_rx.recv_async().await {
            ui::render(&event);
        }
    });

    let session = Session::new(&config.turn, capture, detector, responder, playback)
        .with_state(Arc::clone(&state))
        .with_observer(observer_tx);

    info!(name = %config.name, "handtalk ready");
    tokio::select! {
        result = session.run(inputs_rx) => result?,
        _ = tokio::signal::ctrl_c() => {
            ui::clear_line();
            info!("interrupted");
        }
    }
    debug!(state = ?state, "exiting");
    Ok(())
}

fn build_capture(
    config: &Config,
    console: bool,
    client: &ApiClient,
    tx: flume::Sender<CaptureEvent>,
) -> anyhow::Result<Arc<dyn SpeechCapture>> {
    match config.speech.capture {
        _ if console => Ok(Arc::new(ConsoleCapture::new(tx))),
        CaptureBackend::Console => Ok(Arc::new(ConsoleCapture::new(tx))),
        #[cfg(feature = "audio")]
        CaptureBackend::Microphone => {
            let transcriber = handtalk::transcriber::RemoteTranscriber::new(
                client.clone(),
                &config.speech.stt_deployment,
                handtalk::segmenter::TARGET_RATE as u32,
            );
            Ok(Arc::new(handtalk::audio::MicCapture::new(
                &config.speech,
                transcriber,
                tx,
                tokio::runtime::Handle::current(),
            )))
        }
        #[cfg(not(feature = "audio"))]
        CaptureBackend::Microphone => {
            let _ = client;
            bail!("microphone capture needs the `audio` feature; use --console")
        }
    }
}

fn build_playback(config: &Config, console: bool, client: &ApiClient) -> Arc<dyn SpeechPlayback> {
    let words_per_minute = config.speech.words_per_minute;
    match config.speech.playback {
        _ if console => Arc::new(ConsolePlayback::new(words_per_minute)),
        PlaybackBackend::Console => Arc::new(ConsolePlayback::new(words_per_minute)),
        #[cfg(feature = "audio")]
        PlaybackBackend::Remote => Arc::new(handtalk::tts::RemoteSpeech::new(
            client.clone(),
            &config.speech,
        )),
        #[cfg(not(feature = "audio"))]
        PlaybackBackend::Remote => {
            let _ = client;
            warn!("remote playback needs the `audio` feature, printing replies instead");
            Arc::new(ConsolePlayback::new(words_per_minute))
        }
    }
}

fn open_keypoints(source: &str) -> anyhow::Result<Box<dyn BufRead + Send>> {
    if source == "-" {
        return Ok(Box::new(BufReader::new(std::io::stdin())));
    }
    let file = File::open(Path::new(source))
        .with_context(|| format!("opening keypoint source {source}"))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Track fists in the background; each grab asks the dialogue a question
fn spawn_gestures(
    config: &GestureConfig,
    source: &str,
    state: SharedState,
    inputs: flume::Sender<CaptureEvent>,
) -> anyhow::Result<()> {
    let (frames_tx, frames_rx) = flume::unbounded();
    frames::spawn_reader(open_keypoints(source)?, frames_tx);

    let mut detector = GestureDetector::new(config);
    let prompt = config.grab_prompt.clone();
    tokio::spawn(async move {
        while let Ok(hands) = frames_rx.recv_async().await {
            detector.process(&hands, |grab, _| {
                ui::show_grab(grab);
                let _ = inputs.send(CaptureEvent::Transcript(prompt.clone()));
            });
            state.set_fist_closed(detector.is_closed());
        }
        debug!("keypoint stream ended");
    });
    Ok(())
}

async fn run_gestures(config: &GestureConfig, source: &str) -> anyhow::Result<()> {
    let (frames_tx, frames_rx) = flume::unbounded();
    frames::spawn_reader(open_keypoints(source)?, frames_tx);

    let mut detector = GestureDetector::new(config);
    let mut frame = 0usize;
    let mut was_closed = false;
    let mut grabs = 0usize;
    while let Ok(hands) = frames_rx.recv_async().await {
        frame += 1;
        if detector.process(&hands, |grab, _| ui::show_grab(grab)) {
            grabs += 1;
        }
        if detector.is_closed() != was_closed {
            was_closed = detector.is_closed();
            ui::show_fist(frame, was_closed);
        }
    }
    info!(frames = frame, grabs, "keypoint stream finished");
    Ok(())
}
