//! Zulipgram — a personal Zulip→Telegram bridge.
//!
//! Single Rust binary. Long-polls a Zulip event queue for private
//! messages, converts their markdown into Telegram entity-formatted
//! text, and forwards them to one private chat. A small HTTP listener
//! relays inbound webhooks into the same chat.
//!
//! See `DESIGN.md` for architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod markdown;
pub mod richtext;
pub mod zulip;

pub mod telegram;
pub mod webhook;

pub mod bridge;
