use log::warn;
use std::error::Error;
use std::io::Write;
use tokio::io::{ AsyncBufReadExt, BufReader };

use crate::agent::ChatSession;

const HELP: &str = "\
Commands:
  /new                      start a new chat (config and key are kept)
  /save                     save history and request settings
  /history                  print the transcript
  /temp <0..2>              set sampling temperature
  /timeout <30..120>        set request timeout in seconds
  /model <name>             set the model
  /key <api key>            set the API key for this run
  /code <turn>              list code blocks in a reply
  /export <turn> <n> <path> save code block n of a reply to a file
  /quit                     save and exit
Anything else is sent as a message.";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(String),
    New,
    Save,
    History,
    Temperature(f32),
    Timeout(u64),
    Model(String),
    Key(String),
    Code(usize),
    Export {
        turn: usize,
        block: usize,
        path: String,
    },
    Help,
    Quit,
    Invalid(String),
}

/// `None` for blank lines.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Command::Send(line.to_string()));
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    let command = match name {
        "/new" => Command::New,
        "/save" => Command::Save,
        "/history" => Command::History,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        "/temp" =>
            match rest.parse::<f32>() {
                Ok(value) => Command::Temperature(value),
                Err(_) => Command::Invalid(format!("Expected a number, got '{}'", rest)),
            }
        "/timeout" =>
            match rest.parse::<u64>() {
                Ok(value) => Command::Timeout(value),
                Err(_) => Command::Invalid(format!("Expected whole seconds, got '{}'", rest)),
            }
        "/model" if !rest.is_empty() => Command::Model(rest.to_string()),
        "/key" if !rest.is_empty() => Command::Key(rest.to_string()),
        "/model" | "/key" => Command::Invalid(format!("Usage: {} <value>", name)),
        "/code" =>
            match rest.parse::<usize>() {
                Ok(turn) => Command::Code(turn),
                Err(_) => Command::Invalid(format!("Expected a turn index, got '{}'", rest)),
            }
        "/export" => {
            let args: Vec<&str> = rest.splitn(3, char::is_whitespace).collect();
            let turn = args.first().and_then(|a| a.parse::<usize>().ok());
            let block = args.get(1).and_then(|a| a.parse::<usize>().ok());
            match (turn, block, args.get(2)) {
                (Some(turn), Some(block), Some(path)) if !path.trim().is_empty() =>
                    Command::Export {
                        turn,
                        block,
                        path: path.trim().to_string(),
                    },
                _ => Command::Invalid("Usage: /export <turn> <n> <path>".to_string()),
            }
        }
        other => Command::Invalid(format!("Unknown command '{}', try /help", other)),
    };
    Some(command)
}

fn print_history(session: &ChatSession) {
    for (index, turn) in session.history().iter().enumerate() {
        let speaker = if session.is_self_turn(turn) { "you" } else { turn.role.as_str() };
        println!("[{}] {}: {}", index, speaker, turn.content);
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

async fn send_with_progress(session: &ChatSession, text: &str) {
    let mut progress = session.subscribe_progress();
    let watcher = async {
        while progress.changed().await.is_ok() {
            let value = *progress.borrow_and_update();
            eprint!("\rProgress: {:>6.2}%", value * 100.0);
        }
    };

    let result = tokio::select! {
        result = session.send_async(text) => result,
        _ = watcher => return,
    };
    eprint!("\r");
    match result {
        Ok(reply) => println!("{}", reply),
        Err(e) => eprintln!("Request failed: {}", e),
    }
}

/// Reads commands from stdin until EOF or `/quit`.
pub async fn run(session: &ChatSession) -> Result<(), Box<dyn Error + Send + Sync>> {
    if !session.has_credential() {
        warn!("No API key configured; set CHAT_API_KEY or use /key");
    }
    println!("Chatting with {} ({} turns restored). Type /help for commands.", session.model(), session.history().len());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            None => {}
            Some(Command::Send(text)) => send_with_progress(session, &text).await,
            Some(Command::New) => {
                session.new_chat();
                println!("Started a new chat.");
            }
            Some(Command::Save) =>
                match session.save_history().await {
                    Ok(()) => println!("Saved."),
                    Err(e) => eprintln!("{}", e),
                }
            Some(Command::History) => print_history(session),
            Some(Command::Temperature(value)) => {
                session.set_temperature(value);
                println!("Temperature set to {}", session.temperature());
            }
            Some(Command::Timeout(seconds)) => {
                session.set_timeout_seconds(seconds);
                println!("Timeout set to {}s", session.timeout_seconds());
            }
            Some(Command::Model(model)) => {
                session.set_model(model);
                println!("Model set to {}", session.model());
            }
            Some(Command::Key(key)) => {
                session.set_credential(key);
                println!("API key updated for this run.");
            }
            Some(Command::Code(turn)) =>
                match session.code_blocks(turn) {
                    Some(blocks) => {
                        for (n, block) in blocks.iter().enumerate() {
                            println!("({}) .{} file, {} lines", n, block.file_extension, block.content.lines().count());
                        }
                    }
                    None => println!("No code blocks in turn {}.", turn),
                }
            Some(Command::Export { turn, block, path }) =>
                match session.code_blocks(turn).and_then(|blocks| blocks.into_iter().nth(block)) {
                    Some(code) =>
                        match code.save(&path) {
                            Ok(()) => println!("Saved .{} file to {}", code.file_extension, path),
                            Err(e) => eprintln!("{}", e),
                        }
                    None => eprintln!("Turn {} has no code block {}.", turn, block),
                }
            Some(Command::Help) => println!("{}", HELP),
            Some(Command::Quit) => {
                break;
            }
            Some(Command::Invalid(message)) => eprintln!("{}", message),
        }
        prompt();
    }
    Ok(())
}
