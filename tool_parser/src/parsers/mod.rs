//! Streaming tool parsers

pub mod configured;
pub mod helpers;

pub use configured::ConfiguredParser;
