pub mod action;
pub mod dag;
pub mod events;
pub mod executor;
mod layer;
pub mod planning;

pub use action::{ActionRegistry, EchoAction, NodeAction, TaskContext, TaskExecutor, TaskOutput};
pub use dag::{Dag, Task, TaskId, TaskKind};
pub use events::{EventEnvelope, EventStream, EventSubscriber, ExecutionEvent};
pub use executor::{
    ControlledExecutor, ExecutionHandle, ExecutionOptions, ExecutionState, ExecutionUpdate,
    LayerResult, TaskResult, TerminalResult, TerminalStatus,
};
pub use planning::{PartialDag, StaticSuggester, Suggester};
