pub mod cancel;
pub mod cipher;
pub mod config;
pub mod conflict;
pub mod envelope;
pub mod error;
pub mod events;
pub mod file_storage;
pub mod key_directory;
pub mod lock;
pub mod planner;
pub mod pool;
pub mod results;
pub mod sealed;
pub mod sender_key;
pub mod sender_key_tracker;
pub mod session_store;
pub mod storage;
pub mod test_utils;
pub mod transport;
pub mod types;
pub mod utils;

pub use cancel::CancellationToken;
pub use cipher::{CiphertextMessage, SessionCipher};
pub use config::DeliveryConfig;
pub use conflict::ConflictResolver;
pub use envelope::{EnvelopeCipher, GroupCiphertext, GroupPayload, MultiRecipientMessage};
pub use error::{CipherError, Error, Result, TransportError};
pub use events::{NoopSendEvents, SendEvents};
pub use file_storage::FileStorageAdapter;
pub use key_directory::KeyDirectory;
pub use lock::DeviceLocks;
pub use planner::{DeliveryPlanner, DeliveryPlannerOptions, SendRequest};
pub use results::{SendOutcome, SendResult, SendSummary};
pub use sender_key::{SenderKeyDistribution, SenderKeyState};
pub use sender_key_tracker::SenderKeyTracker;
pub use session_store::{SessionStore, StorageSessionStore};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use transport::{
    FallbackTransport, GroupEnvelope, GroupSendResponse, SendMessageResponse, Transport,
};
pub use types::*;
