// mdsweep-core: filter DSL, discovery, and the sweep scheduler.

pub mod backup;
pub mod discover;
pub mod error;
pub mod filter;
pub mod fleet;
pub mod pool;
pub mod script;
pub mod task;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backup::BackupTarget;
pub use discover::discover;
pub use error::CoreError;
pub use filter::{FilterChain, project};
pub use fleet::{ControllerFactory, FleetSession, SessionApi, SessionFactory};
pub use pool::{SweepOptions, SweepResult, TaskPool};
pub use script::{Script, ScriptContext, ScriptSet};
pub use task::{ExecMode, Task};
