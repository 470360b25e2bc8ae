//! The IRC wire protocol: message model and line framing.

pub mod codec;
pub mod message;

pub use self::codec::IrcCodec;
pub use self::message::{ChannelExt, Message, Tag};
