//! Line-oriented chat console.
//!
//! Reads `<group> <member> <message>` lines from stdin and prints the
//! orchestrator's answers. Replies come from the offline echo provider.

mod command;
mod config;
mod echo;

use chorus_conversation::{
    ConversationError, ConversationKeyResolver, ConversationManager, InMemoryScopingStore,
    JsonFileScopingStore, OrchestratorConfig, ScopingRegistry, ScopingStore, SendRequest,
    ToolRegistry,
};
use chorus_core::Result;
use command::{Command, Line, parse_line};
use config::ConsoleConfig;
use echo::{ClockTool, EchoFactory};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let orchestrator = OrchestratorConfig::from_env().expect("failed to load configuration");
    let console = ConsoleConfig::from_env().expect("failed to load console configuration");

    let store: Arc<dyn ScopingStore> = match &console.scoping_file {
        Some(path) => {
            tracing::info!(path = %path.display(), "Using scoping file");
            Arc::new(JsonFileScopingStore::new(path))
        }
        None => Arc::new(InMemoryScopingStore::new()),
    };
    let scoping = ScopingRegistry::load(
        store,
        ConversationKeyResolver::new(orchestrator.scoping_defaults()),
        orchestrator.flush_debounce(),
    )
    .await
    .expect("failed to load scoping table");

    let tools = ToolRegistry::new().with_plugin(Arc::new(ClockTool));
    let manager = Arc::new(ConversationManager::new(
        orchestrator,
        scoping,
        Arc::new(EchoFactory),
        Arc::new(tools),
    ));
    tracing::info!("Ready; type /help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        match line {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match parse_line(&line) {
                Ok(line) => dispatch(&manager, line),
                Err(e) => println!("! {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read input");
                break;
            }
        }
    }

    if let Err(e) = manager.flush_scoping().await {
        tracing::warn!(error = ?e, "Failed to save scoping table");
    }
}

/// Runs a line. Chat turns run in the background so `/stop` can reach them.
fn dispatch(manager: &Arc<ConversationManager>, line: Line) {
    let Line {
        group,
        member,
        command,
    } = line;
    let prefix = format!("[{group}/{member}]");
    match command {
        Command::Say { text, use_tools } => {
            let manager = Arc::clone(manager);
            let request = SendRequest::new(group, member, text).with_tools(use_tools);
            tokio::spawn(async move {
                println!("{prefix} {}", manager.respond(request).await);
            });
        }
        Command::Retry => {
            let manager = Arc::clone(manager);
            tokio::spawn(async move {
                let reply = manager.retry(&group, &member, false).await;
                println!("{prefix} {}", reply_or_error(reply));
            });
        }
        Command::New { preset } => {
            let result = manager
                .new_conversation(&group, &member, preset)
                .map(|_| "New conversation started.".to_string());
            println!("{prefix} {}", reply_or_error(result));
        }
        Command::Stop => {
            let text = if manager.interrupt(&group, &member) {
                "Stopped."
            } else {
                "Nothing to stop."
            };
            println!("{prefix} {text}");
        }
        Command::Remove => {
            let text = if manager.remove(&group, &member) {
                "Conversation removed."
            } else {
                "No conversation."
            };
            println!("{prefix} {text}");
        }
        Command::ShowPreset => match manager.get_preset(&group, &member) {
            Some((preset, mode)) => println!(
                "{prefix} preset {} ({mode:?}): {}",
                preset.name.as_deref().unwrap_or("custom"),
                preset.prompt
            ),
            None => println!("{prefix} No preset."),
        },
        Command::SetPreset(selection) => {
            let result = manager
                .set_preset(&group, &member, &selection)
                .map(|p| format!("Preset set to {}.", p.name.as_deref().unwrap_or("custom")));
            println!("{prefix} {}", reply_or_error(result));
        }
        Command::ClearPreset => {
            let result = manager
                .clear_preset(&group, &member)
                .map(|()| "Preset cleared.".to_string());
            println!("{prefix} {}", reply_or_error(result));
        }
        Command::Provider(name) => {
            let result = manager
                .switch_provider(&group, &member, &name)
                .map(|()| format!("Provider is now {name}."));
            println!("{prefix} {}", reply_or_error(result));
        }
        Command::Model(name) => {
            let result = manager
                .switch_model(&group, &member, &name)
                .map(|spec| format!("Model is now {}.", spec.name));
            println!("{prefix} {}", reply_or_error(result));
        }
        Command::Usage => match manager.usage(&group, &member) {
            Some(usage) => println!(
                "{prefix} prompt {} completion {} total {}",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            ),
            None => println!("{prefix} No conversation."),
        },
        Command::TotalUsage => {
            let usage = manager.total_usage();
            println!(
                "{prefix} {} conversations, {} tokens",
                manager.len(),
                usage.total_tokens
            );
        }
        Command::Round => println!("{prefix} round {}", manager.round(&group, &member)),
        Command::GroupMode(mode) => {
            manager.update_group_mode(&group, mode);
            println!("{prefix} group mode {mode:?}");
        }
        Command::UserMode(mode) => {
            manager.update_user_mode(&group, &member, mode);
            println!("{prefix} user mode {mode:?}");
        }
        Command::Help => println!("{}", command::HELP),
    }
}

fn reply_or_error(result: Result<String, ConversationError>) -> String {
    match result {
        Ok(text) => text,
        Err(report) => report.current_context().reply_text(),
    }
}
