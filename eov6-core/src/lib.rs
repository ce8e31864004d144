pub mod billing;
pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod models;
pub mod store;
pub mod translate;

pub use billing::{MeterBackend, MeterError, StripeMeterClient, UnavailableMeter, UsageEvent};
pub use blob::{BlobError, BlobStore, FsBlobStore, MemoryBlobStore};
pub use config::Eov6Config;
pub use error::Eov6Error;
pub use identity::{FirebaseIdentityClient, Identity, IdentityError, IdentityVerifier, UnavailableIdentity};
pub use store::{MemoryStore, PgSessionStore, PreviewReservation, SessionStore, StoreError};
pub use translate::{GoogleTranslateClient, TranslateError, Translation, Translator, UnavailableTranslator};
