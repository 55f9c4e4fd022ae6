//! Dialogue-side building blocks around the streaming synthesis client:
//! conversation history, the LLM fragment source, session negotiation and
//! the per-turn lifecycle.

pub mod conversation;
pub mod llm_client;
pub mod negotiation;
pub mod session;
pub mod turn;

pub use conversation::{ChatMessage, Conversation, Role};
pub use llm_client::{FragmentStream, LLMClient, OpenAICompatibleClient};
pub use negotiation::{HttpSessionNegotiator, NegotiationError, SessionNegotiator, TurnRequest};
pub use session::{InvalidTransition, Session, SessionState};
pub use turn::{TurnConfig, TurnError, TurnManager, TurnOutcome};
