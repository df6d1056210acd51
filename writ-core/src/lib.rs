#[cfg(test)]
#[macro_use]
extern crate maplit;

#[macro_use]
pub mod macros;

pub mod bindings;
mod counter;
mod debugger;
pub mod engine;
pub mod error;
pub mod events;
pub mod filter;
mod folder;
pub mod formatting;
pub mod kb;
mod lexer;
pub mod messages;
pub mod numerics;
pub mod parser;
mod partial;
pub mod query;
mod resource_block;
mod rewrites;
pub mod rules;
pub mod sources;
pub mod terms;
pub mod traces;
mod validations;
mod visitor;
mod vm;

pub use engine::Engine;
pub use query::Query;
pub use vm::{QueryOptions, DEFAULT_TIMEOUT_MS, MAX_STACK_SIZE};
