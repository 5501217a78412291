#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_wraps
)]

//! WhatsApp-to-webhook relay.
//!
//! Inbound chat messages flow from a supervised protocol connection through
//! an admission filter to an automation webhook; replies come back after a
//! randomized delay. The linked-device credentials are mirrored to a remote
//! object store so the relay survives restarts without relinking.

pub mod config;
pub mod connection;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod health;
pub mod inbound;
pub mod relay;
pub mod session;
pub mod util;

pub use config::Config;
pub use error::RelayError;
