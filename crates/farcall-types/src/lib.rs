//! Core types for farcall, the remote object invocation protocol.
//!
//! This crate defines the error and configuration types shared by the wire
//! protocol and the command-line tool. It contains no protocol logic.

pub mod config;
pub mod error;
