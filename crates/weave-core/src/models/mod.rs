pub mod agent;
pub mod context;
pub mod definition;
pub mod event;
pub mod step;
pub mod tool_invocation;
pub mod workflow;

pub use agent::*;
pub use context::*;
pub use definition::*;
pub use event::*;
pub use step::*;
pub use tool_invocation::*;
pub use workflow::*;
