pub mod compaction;
pub mod error;
pub mod history;
pub mod locks;

pub use compaction::{CompactionConfig, PersistOutcome};
pub use error::StoreError;
pub use history::{history_path, DEFAULT_STATE_DIR};
pub use locks::SessionLocks;
