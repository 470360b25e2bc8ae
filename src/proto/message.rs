//! A data structure for messages to and from IRC servers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, MessageParseError};

/// An IRCv3 message tag, i.e. a key with an optional value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag(pub String, pub Option<String>);

/// A parsed IRC message.
///
/// The wire form is `['@' tags ' '] [':' prefix ' '] command [args] [' :' trailing]`,
/// terminated by CRLF. The codec strips the terminator before parsing and the
/// sender restores it, so `Message` itself never carries line endings.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Message {
    /// IRCv3 message tags, if the line carried a tag section.
    pub tags: Option<Vec<Tag>>,
    /// The raw prefix (server name or `nick!user@host`), without the leading `:`.
    pub prefix: Option<String>,
    /// The command or three-digit numeric.
    pub command: String,
    /// Middle arguments, in order.
    pub args: Vec<String>,
    /// The trailing argument, without the leading `:`.
    pub trailing: Option<String>,
}

impl Message {
    /// Builds an outgoing message with no tags or prefix.
    pub fn new<S: Into<String>>(command: S, args: Vec<String>, trailing: Option<String>) -> Message {
        Message {
            tags: None,
            prefix: None,
            command: command.into(),
            args,
            trailing,
        }
    }

    /// Parses a single line, stripped of its CRLF/LF terminator.
    pub fn parse(line: &str) -> Result<Message, MessageParseError> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return Err(MessageParseError::EmptyMessage);
        }

        let mut tags = None;
        if let Some(after) = rest.strip_prefix('@') {
            let (section, remainder) = match after.find(' ') {
                Some(idx) => (&after[..idx], &after[idx + 1..]),
                None => (after, ""),
            };
            tags = Some(parse_tags(section));
            rest = remainder;
        }

        rest = rest.trim_start_matches(' ');

        let mut prefix = None;
        if let Some(after) = rest.strip_prefix(':') {
            let (section, remainder) = match after.find(' ') {
                Some(idx) => (&after[..idx], &after[idx + 1..]),
                None => (after, ""),
            };
            prefix = Some(section.to_owned());
            rest = remainder;
        }

        rest = rest.trim_start_matches(' ');

        let command;
        match rest.find(' ') {
            Some(idx) => {
                command = &rest[..idx];
                rest = rest[idx + 1..].trim_start_matches(' ');
            }
            None => {
                command = rest;
                rest = "";
            }
        }
        if command.is_empty() {
            return Err(MessageParseError::MissingCommand);
        }

        let mut args = Vec::new();
        let mut trailing = None;
        while !rest.is_empty() {
            if let Some(rem) = rest.strip_prefix(':') {
                trailing = Some(rem.to_owned());
                break;
            }
            match rest.find(' ') {
                Some(idx) => {
                    args.push(rest[..idx].to_owned());
                    rest = rest[idx + 1..].trim_start_matches(' ');
                }
                None => {
                    args.push(rest.to_owned());
                    rest = "";
                }
            }
        }

        Ok(Message {
            tags,
            prefix,
            command: command.to_owned(),
            args,
            trailing,
        })
    }

    /// Returns the nick portion of the prefix, if the prefix looks like a
    /// user mask (`nick!user@host`, or just `nick`).
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| match p.find(['!', '@']) {
                Some(idx) => &p[..idx],
                None => p,
            })
            .filter(|nick| !nick.is_empty())
    }

    /// Returns the middle argument at `idx`, if present.
    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.args.get(idx).map(String::as_str)
    }

    /// Returns the trailing argument, defaulting to the empty string.
    pub fn trailing_or_empty(&self) -> &str {
        self.trailing.as_deref().unwrap_or("")
    }

    /// Returns the command interpreted as a three-digit numeric, if it is one.
    pub fn numeric(&self) -> Option<u16> {
        if self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit()) {
            self.command.parse().ok()
        } else {
            None
        }
    }

    /// Collects the tag section into a map, with valueless tags mapped to the
    /// empty string.
    pub fn tag_map(&self) -> HashMap<String, String> {
        self.tags
            .iter()
            .flatten()
            .map(|Tag(key, value)| (key.clone(), value.clone().unwrap_or_default()))
            .collect()
    }
}

fn parse_tags(section: &str) -> Vec<Tag> {
    section
        .split(';')
        .filter(|raw| !raw.is_empty())
        .map(|raw| match raw.find('=') {
            Some(idx) => Tag(raw[..idx].to_owned(), Some(unescape_tag_value(&raw[idx + 1..]))),
            None => Tag(raw.to_owned(), None),
        })
        .collect()
}

/// Resolves the IRCv3 tag-value escape sequences. Unknown escapes pass the
/// escaped character through literally.
fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tags) = &self.tags {
            f.write_str("@")?;
            for (i, Tag(key, value)) in tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                f.write_str(key)?;
                if let Some(value) = value {
                    write!(f, "={}", escape_tag_value(value))?;
                }
            }
            f.write_str(" ")?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        f.write_str(&self.command)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        if let Some(trailing) = &self.trailing {
            write!(f, " :{}", trailing)?;
        }
        Ok(())
    }
}

impl FromStr for Message {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Message::parse(s).map_err(|cause| Error::InvalidMessage {
            string: s.to_owned(),
            cause,
        })
    }
}

/// An extension trait giving strings a function to check if they are a channel.
pub trait ChannelExt {
    /// Returns true if the specified name is a channel name.
    fn is_channel_name(&self) -> bool;
}

impl ChannelExt for str {
    fn is_channel_name(&self) -> bool {
        self.starts_with('#') || self.starts_with('&')
    }
}
