//! claude-relay - stream live Claude Code sessions to paired mobile viewers.
//!
//! Watches the agent's session logs under `~/.claude/projects`, parses each
//! appended line into typed records, and relays the live tail over
//! WebSocket to devices paired via QR enrollment. One viewer per session,
//! with cooperative takeover.

pub mod auth;
pub mod broker;
pub mod classifier;
pub mod config;
pub mod registry;
pub mod relay;
pub mod server;
pub mod watcher;
