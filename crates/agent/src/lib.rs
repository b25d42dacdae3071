//! The Waymark agent: budgeted context assembly and the Planner/Navigator
//! loop.
//!
//! A task moves through **Plan → Approve → Act → Observe**:
//!
//! 1. **Assemble** a context pack from the workspace's memory tiers and pins
//! 2. **Plan** with the language model (context + goal + task progress)
//! 3. **Gate** steps whose risk exceeds the workspace's autonomy level
//! 4. **Execute** each step through the browser executor, retrying with backoff
//! 5. **Observe** and append every attempt to episodic memory
//!
//! A failed step or a drifted page sends the task back to planning, up to
//! the replan limit.

pub mod context;
pub mod orchestrator;

#[cfg(test)]
mod test_helpers;

pub use context::{ContextAssembler, PinBoard, WorkingMemory};
pub use orchestrator::{
    ApprovalBroker, Decision, Navigator, Orchestrator, Planner, TaskHandle, TaskReport,
    TaskRequest, Transition,
};
