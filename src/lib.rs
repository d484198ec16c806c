//! Sigilo: session and multi-factor authentication core.
//!
//! Password login, TOTP enrollment and verification, one-time backup codes,
//! PASETO access tokens carrying a per-user session version, and rotating
//! refresh tokens, exposed over an HTTP API.
//!
//! - [`session`] holds the core state machine and its collaborators.
//! - [`api`] wires the core to axum handlers.
//! - [`cli`] parses flags/environment and boots the server.

pub mod api;
pub mod cli;
pub mod session;
