//! command-provider - shell commands as managed, stateful resources
//!
//! A command resource runs a `create` script once, an `update` script (or
//! `create` again) when its inputs change, and a `delete` script when it is
//! removed. Scripts run on the local host or over SSH, optionally through a
//! bastion. Stdout/stderr and selected files are captured as resource state.
//! A copy resource uploads a local file or directory over SFTP instead.
//!
//! The entry point is [`lifecycle::CommandLifecycle`]; [`engine::Engine`]
//! drives it for a whole resource file against a [`state::StateManager`].

pub mod cli;
pub mod collector;
pub mod connector;
pub mod context;
pub mod copy;
pub mod diff;
pub mod engine;
pub mod error;
pub mod executor;
pub mod glob;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod parser;
pub mod retry;
pub mod state;
pub mod templates;
pub mod transport;
