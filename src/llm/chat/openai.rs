use async_trait::async_trait;
use futures::{ stream, StreamExt };
use log::{ debug, error, info };
use reqwest::{
    Body,
    Client as HttpClient,
    header::{ HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE },
};
use std::time::Duration;

use super::{ ChatTransport, ProgressReporter };
use crate::error::ChatError;
use crate::models::completion::RequestEnvelope;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

const UPLOAD_CHUNK_SIZE: usize = 8 * 1024;
// Content-Length is peer-controlled; only trust it this far for preallocation.
const MAX_PREALLOCATED_RESPONSE: u64 = 1024 * 1024;

pub struct OpenAIChatClient {
    http: HttpClient,
    endpoint: String,
}

impl OpenAIChatClient {
    /// Builds a client for `endpoint`, or the public completions endpoint
    /// when none is given.
    ///
    /// Server certificates are NOT validated. This lets the client talk to
    /// endpoints behind arbitrary certificate chains, and means the peer's
    /// identity is never authenticated.
    pub fn new(endpoint: Option<String>) -> Result<Self, ChatError> {
        let endpoint = endpoint
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = HttpClient::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ChatError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        info!("Chat transport configured for {}", endpoint);
        Ok(Self { http, endpoint })
    }

    async fn exchange(
        &self,
        body: Vec<u8>,
        credential: &str,
        progress: &ProgressReporter
    ) -> Result<String, ChatError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", credential)).map_err(|e|
            ChatError::Transport(format!("Invalid API key format: {}", e))
        )?;
        auth.set_sensitive(true);

        let total = body.len();
        let chunks: Vec<Vec<u8>> = body
            .chunks(UPLOAD_CHUNK_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect();
        let upload = progress.clone();
        let mut sent = 0usize;
        let upload_stream = stream::iter(
            chunks.into_iter().map(move |chunk| {
                sent += chunk.len();
                upload.upload((sent as f32) / (total as f32));
                Ok::<_, std::io::Error>(chunk)
            })
        );

        let resp = self.http
            .post(&self.endpoint)
            .header(AUTHORIZATION, auth)
            .header(CONTENT_LENGTH, total)
            .body(Body::wrap_stream(upload_stream))
            .send().await?;
        progress.upload(1.0);

        let status = resp.status();
        if !status.is_success() {
            let err_body = resp.text().await.unwrap_or_default();
            return Err(ChatError::Transport(format!("HTTP {}: {}", status, err_body.trim())));
        }

        let expected = resp.content_length().filter(|len| *len > 0);
        let capacity = expected.unwrap_or(0).min(MAX_PREALLOCATED_RESPONSE) as usize;
        let mut received: Vec<u8> = Vec::with_capacity(capacity);
        let mut bytes = resp.bytes_stream();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            received.extend_from_slice(&chunk);
            if let Some(expected) = expected {
                progress.download((received.len() as f32) / (expected as f32));
            }
        }
        progress.download(1.0);

        String::from_utf8(received).map_err(|e|
            ChatError::Parse(format!("Response body is not valid UTF-8: {}", e))
        )
    }
}

#[async_trait]
impl ChatTransport for OpenAIChatClient {
    async fn execute(
        &self,
        envelope: &RequestEnvelope,
        credential: &str,
        timeout: Duration,
        progress: &ProgressReporter
    ) -> Result<String, ChatError> {
        let body = serde_json::to_vec(envelope).map_err(|e|
            ChatError::Transport(format!("Failed to encode request body: {}", e))
        )?;
        debug!("Outgoing completion request: {}", String::from_utf8_lossy(&body));

        let result = match tokio::time::timeout(timeout, self.exchange(body, credential, progress)).await {
            Ok(result) => result,
            Err(_) =>
                Err(
                    ChatError::Transport(
                        format!("Request timed out after {}s", timeout.as_secs_f32())
                    )
                ),
        };

        match &result {
            Ok(raw) => debug!("Completion response: {}", raw),
            Err(e) => error!("Completion request to {} failed: {}", self.endpoint, e),
        }
        result
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
