use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Completion Endpoint Args ---
    /// Bearer credential for the completion API. Never written to the session store.
    #[arg(long, env = "CHAT_API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,

    /// Full URL of the chat completions endpoint (e.g., https://api.openai.com/v1/chat/completions)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, the client falls back to the public endpoint
    pub base_url: Option<String>,

    /// Model name sent with every request (e.g., gpt-3.5-turbo, gpt-4o)
    #[arg(long, env = "CHAT_MODEL", default_value = "gpt-3.5-turbo")]
    pub model: String,

    /// Sampling temperature. Values outside 0.0 to 2.0 are clamped.
    #[arg(long, env = "CHAT_TEMPERATURE", default_value = "0")]
    pub temperature: f32,

    /// Request timeout in seconds. Values outside 30 to 120 are clamped.
    #[arg(long, env = "CHAT_TIMEOUT", default_value = "60")]
    pub timeout: u64,

    /// Role name used for the local user's turns.
    #[arg(long, env = "CHAT_USER_ID", default_value = "user")]
    pub user_id: String,

    // --- Session Store Args ---
    /// Where session state is kept between runs (file, memory)
    #[arg(long, env = "STORE_TYPE", default_value = "file")]
    pub store_type: String,

    /// Path of the JSON settings file used by the file store.
    #[arg(long, env = "STORE_PATH", default_value = "chat_session.json")]
    pub store_path: String,

    /// Start with an empty chat instead of the saved one.
    #[arg(long, default_value = "false")]
    pub no_restore: bool,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}
