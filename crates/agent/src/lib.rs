//! # Parley Agent
//!
//! The step-evaluate loop on top of `parley-core`.
//!
//! A [`Driver`] keeps stepping an [`parley_core::Llm`] with the query derived
//! from the last reply until the model answers with text, running every
//! requested tool call through a tool function in between. The number of
//! tool-requesting turns is bounded by a cycle limit.
//!
//! [`Shell`] builds on the driver: it takes a serialized history and a user
//! utterance, lets tools deposit tables and graphics into a resource table,
//! and turns the model's JSON answer into a list of [`Element`]s.

pub mod driver;
pub mod element;
pub mod shell;

pub use driver::Driver;
pub use element::{Element, Resources, WrongAnswer, extract_json, textify, unparse_answer};
pub use shell::{Shell, ShellError, ShellTool};
