//! Tool registry plus the built-in time and math toolkits.

pub mod builtin;
pub mod registry;

pub use registry::ToolRegistry;
