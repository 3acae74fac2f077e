// Conductor - declarative host-orchestration execution engine
//
// Runs a play (an ordered task list plus handlers) across a set of hosts
// under batching, concurrency, conditional, retry and failure-isolation
// rules. Concrete actions are supplied by the embedding application.

pub mod executor;
pub mod inventory;
pub mod output;
pub mod parser;
pub mod plugins;
pub mod runtime;

pub use executor::{
    ActionError, ActionInvoker, ActionResult, ExecutionContext, ExecutorConfig, PlayExecutor,
    PlayReport, ResultLedger, ResumeOptions, TaskResult, TaskStatus,
};
pub use inventory::{Host, HostState, InventoryProvider, StaticInventory};
pub use output::{ConductorError, PlayRecap};
pub use parser::{parse_expression, parse_play, Play};
pub use runtime::{evaluate_condition, evaluate_expression};

/// Version of the conductor crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::executor::{
        AbortHandle, ActionError, ActionInvoker, ActionResult, Checkpoint, CheckpointManager,
        ExecutorConfig, HostContext, PlayExecutor, PlayReport, ResumeOptions, StartAt,
        TaskStatus,
    };
    pub use crate::inventory::{Host, InventoryProvider, StaticInventory};
    pub use crate::output::{ConductorError, PlayRecap};
    pub use crate::parser::ast::{
        ActionSpec, Condition, ExecutionPolicy, ExecutionStrategy, Handler, Play, Serial, Task,
        Value,
    };
    pub use crate::parser::parse_play;
    pub use crate::plugins::{CallbackManager, CallbackPlugin};
}
