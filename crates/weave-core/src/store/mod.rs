pub mod agent_store;
pub mod context_store;
pub mod event_store;
pub mod tool_invocation_store;
pub mod workflow_store;

pub use agent_store::AgentStore;
pub use context_store::ContextStore;
pub use event_store::EventStore;
pub use tool_invocation_store::ToolInvocationStore;
pub use workflow_store::WorkflowStore;
