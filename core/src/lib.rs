pub mod args;
pub mod error;
pub mod identity;
pub mod query;
pub mod time_range;
pub mod tools;

pub use error::ToolError;
