pub mod db_restore;
mod logic;
pub mod verification;

pub use logic::{new_session_id, run_restore, RestoreOptions, RestoreOutcome};
