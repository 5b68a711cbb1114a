use std::sync::Arc;

use parley::cli::{self, CliCommand, HELP_TEXT, TranscriptPrinter};
use parley::settings::SettingsError;
use parley::{
    ChatController, ChatError, ChatHandle, ChatResult, ChatService, ChatSnapshot, SessionGate,
    SettingsStore,
};
use parley_llm::EngineError;
use parley_storage::{SqliteStorage, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PARLEY_LOG";

#[derive(Debug, Snafu)]
enum MainError {
    #[snafu(display("failed to open the chat database on `{stage}`"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to configure the engine on `{stage}`"))]
    BuildEngine {
        stage: &'static str,
        source: EngineError,
    },
    #[snafu(display("failed to start the chat on `{stage}`"))]
    StartChat {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("failed to read standard input on `{stage}`"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[snafu::report]
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), MainError> {
    init_logging();

    let mut settings_store = SettingsStore::load();
    let settings = settings_store.settings().clone();
    tracing::debug!(config_path = ?settings_store.config_path(), "loaded settings");

    let gate = SessionGate::default();
    if !settings.user.is_empty()
        && let Err(error) = gate.sign_in(&settings.user)
    {
        tracing::warn!(error = %error, "ignoring configured user");
    }

    let storage = SqliteStorage::open(&settings.database_path)
        .await
        .context(OpenStoreSnafu {
            stage: "open-database",
        })?;
    let engine = settings.engine.build_engine().context(BuildEngineSnafu {
        stage: "build-engine",
    })?;

    let mut controller = ChatController::new(Arc::new(storage), engine);
    controller.start().await.context(StartChatSnafu {
        stage: "start-controller",
    })?;
    let (handle, service) = ChatService::spawn(controller);
    let renderer = tokio::spawn(render_transcript(handle.subscribe()));

    println!("parley: type /help for commands");
    if !gate.is_signed_in() {
        println!("sign in with /signin <name> to start chatting");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "read-line",
    })? {
        let command = match cli::parse_command(&line) {
            Ok(command) => command,
            Err(error) => {
                eprintln!("{error}");
                continue;
            }
        };

        if !command.is_public() && !gate.is_signed_in() {
            eprintln!("sign in first with /signin <name>");
            continue;
        }
        match &command {
            CliCommand::Quit => break,
            CliCommand::ShowSettings => {
                println!("{}", cli::format_settings(settings_store.settings()));
                continue;
            }
            CliCommand::Set { key, value } => {
                match change_setting(&mut settings_store, key, value) {
                    Ok(()) => println!("saved {key}, restart to apply"),
                    Err(error) => eprintln!("error: {error}"),
                }
                continue;
            }
            _ => {}
        }

        if let Err(error) = run_command(&handle, &gate, command).await {
            report(&error);
        }
    }

    renderer.abort();
    drop(handle);
    if let Err(error) = service.await {
        tracing::error!(error = %error, "chat service task failed");
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn change_setting(store: &mut SettingsStore, key: &str, value: &str) -> Result<(), SettingsError> {
    let mut settings = store.settings().clone();
    settings.set(key, value)?;
    store.update(settings)
}

async fn run_command(handle: &ChatHandle, gate: &SessionGate, command: CliCommand) -> ChatResult<()> {
    match command {
        CliCommand::Empty
        | CliCommand::Quit
        | CliCommand::ShowSettings
        | CliCommand::Set { .. } => {}
        CliCommand::Help => println!("{HELP_TEXT}"),
        CliCommand::Init => handle.initialize_engine().await?,
        CliCommand::New(title) => {
            handle.create_conversation(title).await?;
        }
        CliCommand::List => println!("{}", cli::format_conversation_list(&handle.snapshot())),
        CliCommand::Open(index) => {
            let conversation_id = handle.conversation_at(index).await?;
            handle.load_conversation(conversation_id).await?;
        }
        CliCommand::Rename { index, title } => {
            let conversation_id = handle.conversation_at(index).await?;
            handle.rename_conversation(conversation_id, title).await?;
        }
        CliCommand::Delete(index) => {
            let conversation_id = handle.conversation_at(index).await?;
            handle.delete_conversation(conversation_id).await?;
        }
        CliCommand::Clear => handle.clear_messages().await?,
        CliCommand::Wipe => handle.clear_all_data().await?,
        CliCommand::Stop => handle.stop_generation().await?,
        CliCommand::Refresh => handle.refresh().await?,
        CliCommand::SignIn(user) => {
            let session = gate.sign_in(&user)?;
            println!("signed in as {}", session.user);
        }
        CliCommand::SignOut => {
            handle.stop_generation().await?;
            gate.sign_out();
            println!("signed out");
        }
        CliCommand::Send(content) => handle.send_message(content).await?,
    }
    Ok(())
}

fn report(error: &ChatError) {
    match error {
        ChatError::Busy { .. } => eprintln!("still answering, use /stop to interrupt"),
        ChatError::EngineNotLoaded { .. } => eprintln!("model is not loaded, run /init first"),
        error if error.is_silent() => tracing::debug!(error = %error, "command rejected"),
        error => eprintln!("error: {error}"),
    }
}

async fn render_transcript(mut updates: watch::Receiver<ChatSnapshot>) {
    let mut printer = TranscriptPrinter::new();
    let mut stdout = tokio::io::stdout();

    loop {
        let text = printer.update(&updates.borrow_and_update());
        if !text.is_empty() {
            let _ = stdout.write_all(text.as_bytes()).await;
            let _ = stdout.flush().await;
        }
        if updates.changed().await.is_err() {
            break;
        }
    }
}
