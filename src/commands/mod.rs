
pub mod completions;
pub mod filter;
pub mod grab;
