pub mod content;
pub mod context;
pub mod query;
pub mod rule;
