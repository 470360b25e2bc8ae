//! A supervised IRC client daemon.
//!
//! One TLS connection to an IRC network, driven through the full
//! CAP/SASL/NICK/USER registration, with tracked server, channel, and user
//! state, LIST/WHOIS request correlation, a bearer-token HTTP control
//! plane, and JSON webhook fan-out of selected events.
//!
//! The [`client::Core`] type ties it together: build one from a
//! [`config::Config`], spawn [`control::serve`] next to it, and call
//! [`Core::run`](client::Core::run).

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod fanout;
pub mod proto;

pub use crate::client::Core;
pub use crate::config::Config;
pub use crate::error::{Error, Result};
