//! Interactive chat mode with readline support.

use std::future::Future;
use std::io;

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::{Config, Editor};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use sensei_core::{
    find_topic, ControllerError, SendOutcome, SessionController, Topic, TranscriptEvent, TOPICS,
};

use crate::config::Config as AppConfig;
use crate::render::{self, LiveView};

/// How a driven turn ended.
#[derive(Debug)]
pub enum TurnEnd {
    Finished(Result<SendOutcome, ControllerError>),
    /// Ctrl+C while the reply was streaming; the request was dropped.
    Interrupted,
}

/// Run `action` to completion, redrawing the transcript from index `start`
/// on every transcript event.
pub async fn drive_turn<F>(
    controller: &SessionController,
    mut start: usize,
    action: F,
    interactive: bool,
) -> io::Result<TurnEnd>
where
    F: Future<Output = Result<SendOutcome, ControllerError>>,
{
    let mut events = controller.subscribe();
    let mut view = LiveView::new(interactive);
    let mut events_open = true;

    let end = {
        tokio::pin!(action);
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);

        loop {
            tokio::select! {
                result = &mut action => break TurnEnd::Finished(result),
                _ = &mut interrupt => break TurnEnd::Interrupted,
                event = events.recv(), if events_open => {
                    match event {
                        Ok(TranscriptEvent::Reset) => start = 0,
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Transcript events lagged; redrawing from snapshot");
                        }
                        Err(RecvError::Closed) => {
                            events_open = false;
                            continue;
                        }
                    }
                    let snapshot = controller.snapshot();
                    view.redraw(snapshot.get(start..).unwrap_or_default())?;
                }
            }
        }
    };

    // The last events may not have been drawn when the action finished.
    let snapshot = controller.snapshot();
    view.redraw(snapshot.get(start..).unwrap_or_default())?;
    view.finish()?;
    Ok(end)
}

/// Start a new session, rendering the greeting or the topic introduction.
pub async fn open_session(
    controller: &SessionController,
    topic: Option<&'static Topic>,
    interactive: bool,
) -> io::Result<TurnEnd> {
    let end = drive_turn(controller, 0, controller.start_session(topic), interactive).await?;
    report(&end);
    Ok(end)
}

/// Send one user message and render the reply.
pub async fn send_message(
    controller: &SessionController,
    text: &str,
    interactive: bool,
) -> io::Result<TurnEnd> {
    let start = controller.snapshot().len();
    let end = drive_turn(controller, start, controller.send(text), interactive).await?;
    report(&end);
    Ok(end)
}

fn report(end: &TurnEnd) {
    match end {
        TurnEnd::Finished(Ok(SendOutcome::Failed { reason, .. })) => {
            debug!(reason = %reason, "Reply failed");
        }
        TurnEnd::Finished(Ok(_)) => {}
        TurnEnd::Finished(Err(ControllerError::CredentialMissing)) => render::print_remediation(),
        TurnEnd::Finished(Err(e)) => eprintln!("Error: {e}\n"),
        TurnEnd::Interrupted => println!("(cancelled)\n"),
    }
}

/// Chat commands
#[derive(Debug, PartialEq, Eq)]
enum ChatCommand {
    Quit,
    Help,
    Topics,
    Topic(String),
    New,
    Unknown(String),
    Message(String),
}

fn parse_command(input: &str) -> ChatCommand {
    let trimmed = input.trim();

    if !trimmed.starts_with('/') {
        return ChatCommand::Message(trimmed.to_string());
    }

    let parts: Vec<&str> = trimmed.splitn(2, ' ').collect();
    let cmd = parts[0].to_lowercase();
    let arg = parts.get(1).map(|s| s.trim().to_string()).unwrap_or_default();

    match cmd.as_str() {
        "/quit" | "/exit" | "/q" => ChatCommand::Quit,
        "/help" | "/?" => ChatCommand::Help,
        "/topics" | "/t" => ChatCommand::Topics,
        "/topic" => ChatCommand::Topic(arg),
        "/new" | "/n" => ChatCommand::New,
        _ => ChatCommand::Unknown(cmd),
    }
}

fn print_help() {
    println!(
        r#"
Chat Commands:
  /help, /?        Show this help message
  /quit, /exit     Exit chat mode
  /topics, /t      List curriculum topics
  /topic <id|n>    Start a new session on a topic
  /new, /n         Start a new session without a topic

Tips:
  - Press Ctrl+C to cancel the current reply
  - Press Ctrl+D to exit
  - Up/Down arrows navigate history
"#
    );
}

fn print_topics(controller: &SessionController) {
    let text = render::topics_text(TOPICS, controller.active_topic());
    println!("\n{}\n", render::text_to_ansi(&text));
}

fn prompt_for(controller: &SessionController) -> String {
    match controller.active_topic() {
        Some(topic) => format!("you [{}]> ", topic.id),
        None => "you> ".to_string(),
    }
}

/// Run interactive chat mode
pub async fn run_chat(
    controller: &SessionController,
    topic: Option<&'static Topic>,
    interactive: bool,
) -> Result<()> {
    let config = Config::builder()
        .history_ignore_space(true)
        .history_ignore_dups(true)?
        .build();

    let history_path = AppConfig::history_path();
    let mut rl: Editor<(), FileHistory> = Editor::with_config(config)?;

    if let Some(path) = &history_path {
        let _ = rl.load_history(path);
    }

    println!("Chat mode started. Type /help for commands, /quit to exit.\n");
    open_session(controller, topic, interactive).await?;

    loop {
        match rl.readline(&prompt_for(controller)) {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);

                match parse_command(&line) {
                    ChatCommand::Quit => {
                        println!("Goodbye!");
                        break;
                    }
                    ChatCommand::Help => print_help(),
                    ChatCommand::Topics => print_topics(controller),
                    ChatCommand::Topic(key) if key.is_empty() => {
                        print_topics(controller);
                        println!("Usage: /topic <id|n>\n");
                    }
                    ChatCommand::Topic(key) => match find_topic(&key) {
                        Some(topic) => {
                            open_session(controller, Some(topic), interactive).await?;
                        }
                        None => {
                            eprintln!("Unknown topic '{key}'. Type /topics to list them.\n");
                        }
                    },
                    ChatCommand::New => {
                        open_session(controller, None, interactive).await?;
                    }
                    ChatCommand::Unknown(cmd) => {
                        eprintln!("Unknown command: {cmd}. Type /help for available commands.\n");
                    }
                    ChatCommand::Message(text) => {
                        if text.is_empty() {
                            continue;
                        }
                        send_message(controller, &text, interactive).await?;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let _ = rl.save_history(path);
    }

    Ok(())
}
