pub mod artifacts;
pub mod store;

pub use store::{ConversationListing, ConversationStore};
