mod base;

pub use base::BaseReasoningParser;
