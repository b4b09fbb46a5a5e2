mod ledger;
mod lock;
mod manager;
mod types;

pub use ledger::{Ledger, LedgerStore};
pub use lock::{ActivationLocks, TargetLock};
pub use manager::{list, ReleaseManager};
pub use types::{validate_revision, Release, ReleaseStatus};
