pub mod conversation;
pub mod turn;

pub use conversation::{ChatMessage, Conversation, ConversationInfo, TokenStats};
pub use turn::{ArtifactPaths, ModelResult, Turn, UploadedFile};
