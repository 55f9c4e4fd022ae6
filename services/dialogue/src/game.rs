//! The role-play loop: the user types, the character answers out loud.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};
use wavecraft_core::{Conversation, LLMClient, TurnError, TurnManager};

pub const CHARACTER_PROMPT: &str = "Please enter the character setting you want to talk to (e.g., 'A wise but slightly sad ancient robot')";

const EXIT_WORDS: [&str; 3] = ["exit", "quit", "退出"];
const LABEL_CHARS: usize = 10;

/// How a dialogue went, for the caller's final log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialogueSummary {
    pub turns_spoken: usize,
    pub turns_failed: usize,
    pub interrupted: bool,
}

pub fn is_exit_word(line: &str) -> bool {
    let line = line.trim().to_lowercase();
    EXIT_WORDS.contains(&line.as_str())
}

/// First few characters of the setting, used as the speaker label.
fn label(character: &str) -> String {
    let short: String = character.chars().take(LABEL_CHARS).collect();
    if character.chars().count() > LABEL_CHARS {
        format!("{short}...")
    } else {
        short
    }
}

async fn say<W>(output: &mut W, text: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(text.as_bytes()).await?;
    output.flush().await
}

pub struct Dialogue {
    llm: Arc<dyn LLMClient>,
    turns: TurnManager,
}

impl Dialogue {
    pub fn new(llm: Arc<dyn LLMClient>, turns: TurnManager) -> Self {
        Self { llm, turns }
    }

    pub fn turns(&self) -> &TurnManager {
        &self.turns
    }

    /// Plays until the user leaves, input ends or the interrupt token fires.
    ///
    /// Asks for the character setting on `input` when `character` is `None`.
    pub async fn run<I, W>(
        &self,
        character: Option<String>,
        mut input: I,
        output: &mut W,
    ) -> anyhow::Result<DialogueSummary>
    where
        I: Stream<Item = String> + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut summary = DialogueSummary::default();
        let interrupt = self.turns.interrupt_token();

        let character = match character {
            Some(character) => character,
            None => {
                say(output, &format!("{CHARACTER_PROMPT}:\n> ")).await?;
                let line = tokio::select! {
                    _ = interrupt.cancelled() => None,
                    line = input.next() => line,
                };
                match line {
                    Some(line) => line.trim().to_string(),
                    None => {
                        summary.interrupted = interrupt.is_cancelled();
                        say(output, "\nGame client closed.\n").await?;
                        return Ok(summary);
                    }
                }
            }
        };
        info!(character = %character, "Starting dialogue.");
        say(
            output,
            &format!("\nYou are now talking to '{character}'. Type 'exit' to leave.\n"),
        )
        .await?;

        let mut conversation = Conversation::new(&character);
        if self.take_turn(&mut conversation, &character, output, &mut summary).await? {
            loop {
                say(output, "You: ").await?;
                let line = tokio::select! {
                    _ = interrupt.cancelled() => break,
                    line = input.next() => line,
                };
                let Some(line) = line else {
                    info!("Input closed.");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if is_exit_word(line) {
                    say(output, "Thank you for playing. Game over.\n").await?;
                    break;
                }

                conversation.push_user(line);
                if !self.take_turn(&mut conversation, &character, output, &mut summary).await? {
                    break;
                }
            }
        }

        summary.interrupted = interrupt.is_cancelled();
        if summary.interrupted {
            say(output, "\nInterrupt detected. Game over.\n").await?;
        }
        say(output, "Game client closed.\n").await?;
        info!(
            spoken = summary.turns_spoken,
            failed = summary.turns_failed,
            interrupted = summary.interrupted,
            "Dialogue ended."
        );
        Ok(summary)
    }

    /// Speaks the next reply. Returns `false` once the dialogue was interrupted.
    async fn take_turn<W>(
        &self,
        conversation: &mut Conversation,
        character: &str,
        output: &mut W,
        summary: &mut DialogueSummary,
    ) -> std::io::Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        let fragments = self.llm.stream_reply(conversation).await;
        match self.turns.run_turn(fragments).await {
            Ok(outcome) => {
                if outcome.assistant_text.is_empty() {
                    warn!(session_id = %outcome.session_id, "Reply was empty.");
                } else {
                    say(
                        output,
                        &format!("\nAI ({}): {}\n\n", label(character), outcome.assistant_text),
                    )
                    .await?;
                }
                if let Some(path) = &outcome.recording {
                    info!(path = %path.display(), "Turn recorded.");
                }
                conversation.push_assistant(outcome.assistant_text);
                summary.turns_spoken += 1;
                Ok(true)
            }
            Err(TurnError::Interrupted { session_id }) => {
                info!(session_id = %session_id, "Turn interrupted.");
                Ok(false)
            }
            Err(e) => {
                error!(error = %e, "Turn failed.");
                summary.turns_failed += 1;
                say(output, "\n(The reply could not be spoken. Please try again.)\n\n").await?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::{Engine, engine::general_purpose::STANDARD};
    use futures::{SinkExt, stream};
    use iflytek_tts::{
        AudioError, AudioOutput, AudioSink, ClientConfig, SessionDescriptor, VoiceParameters,
    };
    use serde_json::json;
    use std::{sync::Mutex, time::Duration};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message};
    use wavecraft_core::{
        FragmentStream, NegotiationError, Role, SessionNegotiator, TurnConfig, TurnRequest,
    };

    /// Replies with fixed text and records the roles it was shown.
    struct ScriptedLlm {
        reply: Vec<&'static str>,
        seen: Mutex<Vec<Vec<Role>>>,
    }

    #[async_trait]
    impl LLMClient for ScriptedLlm {
        async fn stream_reply(&self, conversation: &Conversation) -> FragmentStream {
            let roles = conversation.messages().iter().map(|m| m.role).collect();
            self.seen.lock().unwrap().push(roles);
            let reply: Vec<String> = self.reply.iter().map(|s| s.to_string()).collect();
            Box::pin(stream::iter(reply))
        }
    }

    #[derive(Default)]
    struct FakeNegotiator {
        endpoint: Option<String>,
        confirmed: Mutex<Vec<(bool, usize)>>,
    }

    #[async_trait]
    impl SessionNegotiator for FakeNegotiator {
        async fn acquire(
            &self,
            _request: &TurnRequest,
        ) -> Result<SessionDescriptor, NegotiationError> {
            match &self.endpoint {
                Some(endpoint) => Ok(SessionDescriptor {
                    session_id: format!("s-{}", self.confirmed.lock().unwrap().len()),
                    endpoint: endpoint.clone(),
                    parameters: VoiceParameters::default(),
                }),
                None => Err(NegotiationError::Status {
                    status: 402,
                    body: "out of credit".to_string(),
                }),
            }
        }

        async fn confirm(
            &self,
            _session_id: &str,
            success: bool,
            actual_text_length: usize,
        ) -> Result<(), NegotiationError> {
            self.confirmed
                .lock()
                .unwrap()
                .push((success, actual_text_length));
            Ok(())
        }

        async fn cancel(&self, _session_id: &str) -> Result<(), NegotiationError> {
            Ok(())
        }
    }

    struct SilentSink;

    impl AudioSink for SilentSink {
        fn write(&mut self, _pcm: &[u8]) -> Result<(), AudioError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    struct SilentOutput;

    impl AudioOutput for SilentOutput {
        fn open(&self) -> Result<Box<dyn AudioSink>, AudioError> {
            Ok(Box::new(SilentSink))
        }
    }

    /// Answers every connection with one final audio frame once the client
    /// has sent its last text frame.
    async fn serve_every_turn() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(Ok(message)) = ws.next().await {
                        if let Message::Text(text) = message {
                            let frame: serde_json::Value =
                                serde_json::from_str(text.as_str()).unwrap();
                            if frame["header"]["status"] == 2 {
                                break;
                            }
                        }
                    }
                    let reply = json!({
                        "header": { "code": 0, "status": 2 },
                        "payload": { "audio": { "audio": STANDARD.encode([0u8, 0]) } }
                    });
                    let _ = ws.send(Message::Text(reply.to_string().into())).await;
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
        url
    }

    fn dialogue(llm: Arc<ScriptedLlm>, negotiator: Arc<FakeNegotiator>) -> Dialogue {
        let client = ClientConfig {
            frame_pacing: Duration::from_millis(1),
            drain_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
            ..ClientConfig::new("test-app")
        };
        let turns = TurnManager::new(
            negotiator,
            Arc::new(SilentOutput),
            TurnConfig {
                client,
                request: TurnRequest::default(),
            },
        );
        Dialogue::new(llm, turns)
    }

    fn scripted(reply: Vec<&'static str>) -> Arc<ScriptedLlm> {
        Arc::new(ScriptedLlm {
            reply,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn lines(items: &[&str]) -> impl Stream<Item = String> + Unpin + use<> {
        stream::iter(items.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_exit_words() {
        assert!(is_exit_word("exit"));
        assert!(is_exit_word("  QUIT "));
        assert!(is_exit_word("退出"));
        assert!(!is_exit_word("exit now"));
        assert!(!is_exit_word(""));
    }

    #[test]
    fn test_label_shortens_long_settings() {
        assert_eq!(label("robot"), "robot");
        assert_eq!(label("A wise but slightly sad robot"), "A wise but...");
        assert_eq!(label("一个聪明但有点悲伤的古老机器人"), "一个聪明但有点悲伤的...");
    }

    #[tokio::test]
    async fn test_full_dialogue_grows_the_conversation() {
        let url = serve_every_turn().await;
        let llm = scripted(vec!["Greetings, ", "traveller."]);
        let negotiator = Arc::new(FakeNegotiator {
            endpoint: Some(url),
            ..Default::default()
        });
        let dialogue = dialogue(llm.clone(), negotiator.clone());
        let mut output = Vec::new();

        let summary = dialogue
            .run(Some("An old robot".to_string()), lines(&["Who are you?", "exit"]), &mut output)
            .await
            .unwrap();

        assert_eq!(
            summary,
            DialogueSummary {
                turns_spoken: 2,
                turns_failed: 0,
                interrupted: false,
            }
        );
        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen[0], vec![Role::System, Role::User]);
        assert_eq!(
            seen[1],
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(
            *negotiator.confirmed.lock().unwrap(),
            vec![(true, 21), (true, 21)]
        );
        let printed = String::from_utf8(output).unwrap();
        assert!(printed.contains("AI (An old rob...): Greetings, traveller."));
        assert!(printed.contains("Game over."));
    }

    #[tokio::test]
    async fn test_failed_turns_keep_the_game_going() {
        let llm = scripted(vec!["unused"]);
        let negotiator = Arc::new(FakeNegotiator::default());
        let dialogue = dialogue(llm.clone(), negotiator);
        let mut output = Vec::new();

        let summary = dialogue
            .run(Some("robot".to_string()), lines(&["hello", "", "again"]), &mut output)
            .await
            .unwrap();

        assert_eq!(summary.turns_spoken, 0);
        assert_eq!(summary.turns_failed, 3);
        assert!(!summary.interrupted);
        // Failed replies are never added to the history.
        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], vec![Role::System, Role::User, Role::User, Role::User]);
        let printed = String::from_utf8(output).unwrap();
        assert!(printed.contains("could not be spoken"));
        assert!(printed.ends_with("Game client closed.\n"));
    }

    #[tokio::test]
    async fn test_character_prompt_and_closed_input() {
        let llm = scripted(vec!["hi"]);
        let dialogue = dialogue(llm.clone(), Arc::new(FakeNegotiator::default()));
        let mut output = Vec::new();

        let summary = dialogue.run(None, lines(&[]), &mut output).await.unwrap();

        assert_eq!(summary, DialogueSummary::default());
        assert!(llm.seen.lock().unwrap().is_empty());
        let printed = String::from_utf8(output).unwrap();
        assert!(printed.starts_with(CHARACTER_PROMPT));
    }

    #[tokio::test]
    async fn test_interrupt_ends_the_game() {
        let llm = scripted(vec!["hi"]);
        let dialogue = dialogue(llm.clone(), Arc::new(FakeNegotiator::default()));
        let mut output = Vec::new();
        let interrupt = dialogue.turns().interrupt_token();

        // Input that never ends; only the interrupt can stop the loop.
        let input = stream::pending::<String>();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            interrupt.cancel();
        });
        let summary = dialogue
            .run(Some("robot".to_string()), input, &mut output)
            .await
            .unwrap();
        handle.await.unwrap();

        assert!(summary.interrupted);
        let printed = String::from_utf8(output).unwrap();
        assert!(printed.contains("Interrupt detected. Game over."));
    }
}
