pub mod agent;
pub mod cli;
pub mod code_blocks;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod repl;

use agent::{ ChatSession, SessionOptions };
use cli::Args;
use history::create_settings_store;
use llm::chat::new_client as new_chat_client;
use log::info;
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let options = SessionOptions::from_args(&args);
    let transport = new_chat_client(args.base_url.clone())?;

    info!("--- Core Configuration ---");
    info!("Endpoint: {}", transport.endpoint());
    info!("Model: {}", options.config.model());
    info!("Temperature: {}", options.config.temperature());
    info!("Timeout: {}s", options.config.timeout_seconds());
    info!("User Id: {}", args.user_id);
    info!("Store Type: {}", args.store_type);
    info!("Store Path: {}", args.store_path);
    info!("Restore On Start: {}", !args.no_restore);
    info!("-------------------------");

    let store = create_settings_store(&args)?;
    let session = ChatSession::new(transport, store, options);

    if !args.no_restore {
        session.restore_history().await;
    }

    repl::run(&session).await?;
    session.save_history().await?;
    info!("Session saved, bye");
    Ok(())
}
