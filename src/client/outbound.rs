//! Outgoing PRIVMSG shaping: newline splitting, payload chunking, and the
//! flood-protection paste hook.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::process::Command;

use crate::config::Config;

/// Payload cap per line, leaving prefix headroom inside the 512-byte limit.
pub const MAX_PAYLOAD_BYTES: usize = 450;

static PASTE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Splits a message body into wire payloads: one per embedded newline, with
/// oversized segments re-chunked at [`MAX_PAYLOAD_BYTES`] on char
/// boundaries. Concatenating the results (with newlines at the original
/// split points) reproduces the input.
pub fn split_message(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    for segment in text.split('\n') {
        if segment.len() <= MAX_PAYLOAD_BYTES {
            lines.push(segment.to_owned());
            continue;
        }
        let mut rest = segment;
        while rest.len() > MAX_PAYLOAD_BYTES {
            let mut cut = MAX_PAYLOAD_BYTES;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            lines.push(rest[..cut].to_owned());
            rest = &rest[cut..];
        }
        lines.push(rest.to_owned());
    }
    lines
}

/// The flood-protection policy derived from configuration.
#[derive(Clone, Debug)]
pub struct FloodPolicy {
    protected: Vec<String>,
    pub line_threshold: usize,
    pub paste_command: Option<String>,
}

impl FloodPolicy {
    pub fn from_config(config: &Config) -> FloodPolicy {
        FloodPolicy {
            protected: config
                .flood
                .protected_channels
                .iter()
                .map(|c| c.to_ascii_lowercase())
                .collect(),
            line_threshold: config.flood.line_threshold,
            paste_command: config.flood.paste_command.clone(),
        }
    }

    /// Case-insensitive membership in the protected-channel set.
    pub fn is_protected(&self, target: &str) -> bool {
        let target = target.to_ascii_lowercase();
        self.protected.iter().any(|c| *c == target)
    }

    /// Whether this send should be diverted through the paste service.
    pub fn should_divert(&self, target: &str, line_count: usize) -> bool {
        self.paste_command.is_some()
            && line_count > self.line_threshold
            && self.is_protected(target)
    }
}

/// Runs the configured paste command with `{{filename}}` pointing at a temp
/// file holding `text`, returning the trimmed stdout as the paste URL.
pub async fn run_paste_command(template: &str, text: &str) -> io::Result<String> {
    let path = std::env::temp_dir().join(format!(
        "ircship-paste-{}-{}.txt",
        std::process::id(),
        PASTE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    tokio::fs::write(&path, text).await?;
    let command = template.replace("{{filename}}", &path.to_string_lossy());
    let output = Command::new("sh").arg("-c").arg(&command).output().await;
    let _ = tokio::fs::remove_file(&path).await;

    let output = output?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "paste command exited with {}",
            output.status
        )));
    }
    let url = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if url.is_empty() {
        return Err(io::Error::other("paste command produced no output"));
    }
    Ok(url)
}
