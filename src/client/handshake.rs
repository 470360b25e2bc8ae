//! Connection registration: server password, capability negotiation, SASL
//! PLAIN, the NICK/USER pair, and nick sanitization.
//!
//! The driver below runs once per fresh connection. The CAP/AUTHENTICATE
//! reply handling lives in the protocol engine; the two halves meet at the
//! [`Registration`] state machine and its single-capacity outcome latch.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::conn::Sender;
use crate::client::state::StateStore;
use crate::config::Config;
use crate::error::Result;

/// SASL must reach a terminal state within this window; past it the client
/// registers unauthenticated.
pub const SASL_TIMEOUT: Duration = Duration::from_secs(30);

/// Fallback identity when sanitization leaves nothing usable.
pub const DEFAULT_NICK: &str = "ircship";

const MAX_NICK_BYTES: usize = 63;

/// SASL negotiation states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaslState {
    Idle,
    Requested,
    InProgress,
    Succeeded,
    Failed,
    Aborted,
    TimedOut,
}

impl SaslState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            SaslState::Succeeded | SaslState::Failed | SaslState::Aborted | SaslState::TimedOut
        )
    }
}

/// Per-connection registration state. A fresh one is built for every dial,
/// so nothing here needs explicit resetting.
pub struct Registration {
    sasl: Mutex<SaslState>,
    outcome_tx: mpsc::Sender<SaslState>,
    outcome_rx: tokio::sync::Mutex<mpsc::Receiver<SaslState>>,
}

impl Registration {
    pub fn new() -> Registration {
        let (outcome_tx, outcome_rx) = mpsc::channel(1);
        Registration {
            sasl: Mutex::new(SaslState::Idle),
            outcome_tx,
            outcome_rx: tokio::sync::Mutex::new(outcome_rx),
        }
    }

    pub fn sasl_state(&self) -> SaslState {
        *self.sasl.lock()
    }

    pub fn set_sasl_state(&self, state: SaslState) {
        *self.sasl.lock() = state;
    }

    /// Records a terminal SASL outcome and wakes the registration driver.
    /// The latch holds one value; duplicate signals are discarded.
    pub fn signal_outcome(&self, outcome: SaslState) {
        debug_assert!(outcome.is_terminal());
        *self.sasl.lock() = outcome;
        let _ = self.outcome_tx.try_send(outcome);
    }

    async fn wait_outcome(&self) -> Option<SaslState> {
        self.outcome_rx.lock().await.recv().await
    }
}

impl Default for Registration {
    fn default() -> Registration {
        Registration::new()
    }
}

/// Strips a nick down to the accepted alphabet, trims surrounding spaces,
/// and caps the length. An empty result falls back to [`DEFAULT_NICK`].
pub fn sanitize_nick(input: &str) -> String {
    let mut nick: String = input
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '[' | ']' | '{' | '}' | '`' | ' ')
        })
        .collect();
    nick = nick.trim_matches(' ').to_owned();
    while nick.len() > MAX_NICK_BYTES {
        nick.pop();
    }
    if nick.is_empty() {
        DEFAULT_NICK.to_owned()
    } else {
        nick
    }
}

/// The SASL PLAIN initial response: base64 of `\0user\0pass`.
pub fn sasl_plain_payload(user: &str, pass: &str) -> String {
    BASE64.encode(format!("\0{}\0{}", user, pass))
}

/// Runs the ordered registration sequence on a fresh connection: PASS,
/// CAP REQ, an optional SASL wait, then NICK and USER. CAP replies arrive on
/// the read loop, which signals the outcome latch this function blocks on.
pub(crate) async fn run_registration(
    config: &Config,
    sender: &Sender,
    registration: &Registration,
    state: &StateStore,
) -> Result<()> {
    if let Some(pass) = &config.server_password {
        sender.send_line(format!("PASS :{}", pass)).await?;
    }

    let sasl = config.sasl_credentials().is_some();
    let caps = if sasl {
        registration.set_sasl_state(SaslState::Requested);
        "message-tags sasl"
    } else {
        "message-tags"
    };
    sender.send_line(format!("CAP REQ :{}", caps)).await?;

    if sasl {
        match tokio::time::timeout(SASL_TIMEOUT, registration.wait_outcome()).await {
            Ok(outcome) => {
                log::debug!("SASL finished: {:?}", outcome);
            }
            Err(_) => {
                log::warn!("SASL did not complete within 30s; registering unauthenticated");
                registration.set_sasl_state(SaslState::TimedOut);
                sender.send_line("CAP END").await?;
            }
        }
    }

    let nick = sanitize_nick(&config.nick);
    state.with_identity_mut(|id| {
        id.nick = nick.clone();
        id.user = config.user().to_owned();
        id.real_name = config.real_name().to_owned();
    });

    sender.send_line(format!("NICK {}", nick)).await?;
    sender
        .send_line(format!("USER {} 0 * :{}", config.user(), config.real_name()))
        .await?;
    Ok(())
}
