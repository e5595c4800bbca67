/// ChatSync - conversation synchronization core
///
/// Keeps a user's conversation list consistent, ordered and correctly counted
/// while bulk fetches, enrichment lookups and live push events arrive in any order.

pub mod error;
pub mod config;
pub mod model;
pub mod events;
pub mod store;
pub mod reconciler;
pub mod read_state;
pub mod enrichment;
pub mod api;
pub mod session;
pub mod sim;

pub use error::{Result, SyncError};
pub use config::SyncConfig;
pub use model::{Conversation, ConversationKind, Counterpart, GroupDescriptor, Message, MessageSnapshot, ParticipantDescriptor};
pub use session::{StoreSnapshot, SyncSession, SyncWarning};
