//! Farm config document: typed model, parser and derivation.
//!
//! A [`ConfigData`] is only ever produced by [`ConfigParser`], so holding one
//! means the topology passed every check and all container names and ports
//! are assigned.

pub mod derive;
pub mod example;
pub mod parser;
pub mod types;


pub use example::{example_document, write_example_config_file};
pub use parser::ConfigParser;
pub use types::*;
