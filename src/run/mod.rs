mod context;
mod events;
mod knowledge;
mod state;

pub use context::RunContext;
pub use events::{Bucket, Details, Event, EventLog, EventStatus, OVERALL};
pub use knowledge::{Counters, KnowledgeStore};
pub use state::{RunState, INDEX_KEY, REBOOT_PENDING_KEY};
