//! Result persistence.

pub mod writer;

pub use writer::{render_markdown, write_answer};
