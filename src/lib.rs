pub mod catalog;
pub mod cli;
pub mod gpt;
pub mod repl;
