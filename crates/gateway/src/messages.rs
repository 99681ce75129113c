//! Wire types of the two public dialects and the unified model between them.

pub(crate) mod anthropic;
pub(crate) mod openai;
pub mod unified;
