//! Commands and built-in tools of the `parley` binary.

pub mod commands;
pub mod tools;
