//! The chat client: local conversation store, saved model selection, the
//! streaming session state machine and a terminal front end.

pub mod repl;
pub mod session;
pub mod settings;
pub mod store;
pub mod transport;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use session::{ChatSession, SessionError, SessionEvent};
pub use settings::{Selection, Settings};
pub use store::{ConversationStore, FileStore, KeyValueStore, MemoryStore, StoreError};
pub use transport::{ChatError, ChatTransport, FragmentStream, HttpTransport};
pub use workspace::{Workspace, WorkspaceError};
