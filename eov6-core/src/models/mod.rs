pub mod backfill;
pub mod details;
pub mod entitlement;
pub mod job;
pub mod message;
pub mod session;

pub use backfill::{next_attempt_delay, BackfillStatus, MeterBackfill, NewBackfill, MAX_BACKFILL_DELAY_SECS};
pub use details::CallerDetails;
pub use entitlement::OrgEntitlement;
pub use job::{JobKind, JobRun, JobTrigger};
pub use message::{ChatMessage, Sender};
pub use session::{
    generate_code, is_valid_code, Session, SessionRejection, SessionStatus, StaleCutoffs,
};
