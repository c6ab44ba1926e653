//! vocabgen: Vocabulary Question Generation
//!
//! Orchestrates a pool of worker loops that ask a chat-completion model for
//! multiple-choice vocabulary questions, validate the replies and persist the
//! rows, with pause, resume, live parallelism changes and a regeneration queue.

pub mod api;
pub mod cli;
pub mod completion;
pub mod config;
pub mod control;
pub mod control_channel;
pub mod controller;
pub mod error;
pub mod logging;
pub mod parser;
pub mod provider;
pub mod regeneration;
pub mod session;
pub mod store;
pub mod types;
pub mod validate;
pub mod vocabulary;
