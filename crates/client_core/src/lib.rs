pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod presence;
pub mod reconciler;
pub mod rest;
pub mod rooms;
pub mod session;
pub mod socketio;
pub mod transport;

pub use config::{load_settings, load_settings_from, ClientSettings};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStatus, ReconnectPolicy,
};
pub use directory::ConversationDirectory;
pub use error::ClientError;
pub use presence::{PresenceSet, TypingDebouncer, TypingTracker};
pub use reconciler::{
    apply_read_receipt, merge_history, merge_push, ChatMessage, LoadPhase, MergeOutcome,
    MessageCache, PushKind,
};
pub use rest::{HttpMessagingApi, MessagingApi, RetryPolicy};
pub use rooms::RoomMembership;
pub use session::{Identity, MessagingSession, SendRoute, SessionEvent};
pub use transport::{Connector, Link, LinkPeer, SocketIoConnector};
