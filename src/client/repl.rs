use anyhow::Context;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::session::SessionEvent;
use super::store::FileStore;
use super::transport::HttpTransport;
use super::workspace::{Workspace, WorkspaceError};
use super::SessionError;
use crate::config::ClientConfig;

/// One line of terminal input.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplCommand {
    Say(String),
    New,
    List,
    /// 1-based position in the listing.
    Switch(usize),
    Delete(usize),
    Rename(String),
    Model { provider: String, model: String },
    Regenerate,
    Retry,
    Quit,
    Help,
}

impl ReplCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Say(line.to_string()));
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        let index = |arg: &str| {
            arg.parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| format!("/{name} needs a conversation number from /list"))
        };
        match name {
            "new" => Ok(Self::New),
            "list" => Ok(Self::List),
            "switch" => index(arg).map(Self::Switch),
            "delete" => index(arg).map(Self::Delete),
            "rename" if !arg.is_empty() => Ok(Self::Rename(arg.to_string())),
            "rename" => Err("/rename needs a title".to_string()),
            "model" => match arg.split_whitespace().collect::<Vec<_>>().as_slice() {
                [provider, model] => Ok(Self::Model {
                    provider: provider.to_string(),
                    model: model.to_string(),
                }),
                _ => Err("usage: /model <provider> <model>".to_string()),
            },
            "regenerate" => Ok(Self::Regenerate),
            "retry" => Ok(Self::Retry),
            "quit" | "exit" => Ok(Self::Quit),
            "help" => Ok(Self::Help),
            other => Err(format!("unknown command /{other}, try /help")),
        }
    }
}

const HELP: &str = "\
/new                  start a new conversation
/list                 list conversations
/switch N             switch to conversation N
/delete N             delete conversation N
/rename TITLE         rename the current conversation
/model PROVIDER MODEL choose the model for new turns
/regenerate           answer the last message again
/retry                resend after an error
/quit                 leave
Ctrl-C while an answer streams stops it.";

/// Runs the interactive terminal chat until `/quit` or end of input.
pub async fn run(config: ClientConfig) -> anyhow::Result<()> {
    let kv = FileStore::open(&config.data_dir)
        .with_context(|| format!("Failed to open local store in {}", config.data_dir.display()))?;
    let transport = HttpTransport::new(config.server.clone());
    let mut workspace = Workspace::open(
        Arc::new(kv),
        Arc::new(transport),
        Duration::from_secs(config.stall_timeout_secs),
    );

    println!("polychat: talking to {}. Type /help for commands.", config.server);
    print_active(&workspace);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match ReplCommand::parse(&line) {
            Ok(command) => command,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };
        if command == ReplCommand::Quit {
            break;
        }
        if let Err(e) = execute(&mut workspace, command).await {
            report(&e);
        }
        if workspace.session().is_streaming() {
            stream_answer(&mut workspace).await?;
        }
    }
    Ok(())
}

async fn execute(workspace: &mut Workspace, command: ReplCommand) -> Result<(), WorkspaceError> {
    match command {
        ReplCommand::Say(text) => workspace.submit(&text).await?,
        ReplCommand::New => {
            workspace.new_chat();
            print_active(workspace);
        }
        ReplCommand::List => {
            let active = workspace.active().id.clone();
            for (i, conversation) in workspace.conversations().iter().enumerate() {
                let marker = if conversation.id == active { "*" } else { " " };
                println!(
                    "{marker}{:>3}. {} ({} messages, {}/{})",
                    i + 1,
                    conversation.title,
                    conversation.messages.len(),
                    conversation.provider,
                    conversation.model
                );
            }
        }
        ReplCommand::Switch(n) => {
            let id = nth_id(workspace, n)?;
            workspace.select(&id)?;
            print_active(workspace);
            for message in &workspace.active().messages {
                println!("[{}] {}", message.role, message.content);
            }
        }
        ReplCommand::Delete(n) => {
            let id = nth_id(workspace, n)?;
            workspace.delete(&id)?;
            print_active(workspace);
        }
        ReplCommand::Rename(title) => {
            let id = workspace.active().id.clone();
            workspace.rename(&id, &title)?;
        }
        ReplCommand::Model { provider, model } => {
            workspace.select_model(&provider, &model)?;
            println!("Using {provider}/{model}");
        }
        ReplCommand::Regenerate => workspace.regenerate().await?,
        ReplCommand::Retry => workspace.retry().await?,
        ReplCommand::Help => println!("{HELP}"),
        ReplCommand::Quit => {}
    }
    Ok(())
}

/// Prints fragments as they arrive; Ctrl-C stops the answer, not the program.
async fn stream_answer(workspace: &mut Workspace) -> anyhow::Result<()> {
    enum Step {
        Event(Option<SessionEvent>),
        Interrupted,
    }

    let mut stdout = std::io::stdout();
    loop {
        let step = tokio::select! {
            event = workspace.next_event() => Step::Event(event),
            _ = tokio::signal::ctrl_c() => Step::Interrupted,
        };
        match step {
            Step::Event(Some(SessionEvent::Delta(text))) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            Step::Event(Some(SessionEvent::Completed) | None) => {
                writeln!(stdout)?;
                break;
            }
            Step::Event(Some(SessionEvent::Failed(e))) => {
                writeln!(stdout)?;
                println!("! {} (type /retry to try again)", e.user_message());
                break;
            }
            Step::Interrupted => {
                workspace.stop()?;
                writeln!(stdout, " [stopped]")?;
                break;
            }
        }
    }
    Ok(())
}

fn nth_id(workspace: &Workspace, n: usize) -> Result<String, WorkspaceError> {
    workspace
        .conversations()
        .get(n - 1)
        .map(|c| c.id.clone())
        .ok_or_else(|| WorkspaceError::NotFound(format!("#{n}")))
}

fn print_active(workspace: &Workspace) {
    let active = workspace.active();
    println!(
        "Conversation: {} [{}/{}]",
        active.title,
        workspace.selection().provider,
        workspace.selection().model
    );
}

fn report(error: &WorkspaceError) {
    match error {
        WorkspaceError::Session(SessionError::Request(e)) => println!("! {}", e.user_message()),
        other => println!("! {other}"),
    }
}
