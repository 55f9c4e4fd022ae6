use crate::conversation::{ChatMessage, Conversation, Role};
use anyhow::Result;
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt, future, stream};
use std::pin::Pin;
use tracing::{debug, error, info};

/// Spoken in place of a reply when the model cannot be reached.
pub const APOLOGY: &str = "Sorry, I ran into a problem.";

/// A lazily produced reply, one text fragment at a time.
pub type FragmentStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A generic client for interacting with an LLM.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Streams the next assistant reply for `conversation`.
    ///
    /// Never fails: errors are logged and the stream yields [`APOLOGY`]
    /// before ending.
    async fn stream_reply(&self, conversation: &Conversation) -> FragmentStream;
}

/// An implementation of `LLMClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions (e.g., "gpt-4o-mini").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    async fn open_stream(&self, conversation: &Conversation) -> Result<FragmentStream> {
        let messages = conversation
            .messages()
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>>>()?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .stream(true)
            .build()?;

        let stream = self.client.chat().create_stream(request).await?;

        // The first error ends the reply with an apology.
        let fragments = stream
            .scan(false, |failed, result| {
                if *failed {
                    return future::ready(None);
                }
                let fragment = match result {
                    Ok(response) => response
                        .choices
                        .first()
                        .and_then(|choice| choice.delta.content.clone())
                        .filter(|content| !content.is_empty()),
                    Err(e) => {
                        error!(error = %e, "Error reading chat completion stream.");
                        *failed = true;
                        Some(APOLOGY.to_string())
                    }
                };
                future::ready(Some(fragment))
            })
            .filter_map(future::ready)
            .inspect(|fragment| debug!(fragment = %fragment.trim(), "LLM fragment."));

        Ok(Box::pin(fragments))
    }
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn stream_reply(&self, conversation: &Conversation) -> FragmentStream {
        info!(model = %self.model, messages = conversation.len(), "Requesting reply stream.");
        match self.open_stream(conversation).await {
            Ok(fragments) => fragments,
            Err(e) => {
                error!(error = %e, "Error getting stream from LLM.");
                Box::pin(stream::once(future::ready(APOLOGY.to_string())))
            }
        }
    }
}

fn to_request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage> {
    let content = message.content.clone();
    let request = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()?
            .into(),
    };
    Ok(request)
}
