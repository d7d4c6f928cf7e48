use serde::{ Serialize, Deserialize };

use super::chat::Turn;

/// Outgoing body for the chat completions endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestEnvelope {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<Turn>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Choice {
    pub message: Turn,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: u32,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CompletionResult {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    pub choices: Vec<Choice>,
}
