//! The client core: one supervised IRC connection, the trackers around it,
//! and the synchronous operations the control surface calls into.

pub mod conn;
mod handlers;
pub mod handshake;
pub mod outbound;
pub mod pending;
pub mod state;
mod supervisor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::client::conn::{Connection, Sender};
use crate::client::handlers::Engine;
use crate::client::handshake::{run_registration, sanitize_nick, Registration};
use crate::client::outbound::{run_paste_command, split_message, FloodPolicy};
use crate::client::pending::{
    whois_structured, ListEntry, PendingTable, RequestData, RequestKind, CALLER_WAIT,
    REQUEST_LIFETIME,
};
use crate::client::state::{ChannelState, IrcError, ServerInfo, StatEntry, StateStore, UserInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fanout::Dispatcher;

/// The connection lifecycle. Only `Alive` permits application commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Dialing,
    Registering,
    Alive,
    Draining,
}

/// Cross-task connection handles: the lifecycle state, the current sender,
/// and the welcome flag the supervisor consumes for its backoff reset.
pub(crate) struct Shared {
    conn_state: RwLock<ConnState>,
    sender: RwLock<Option<Sender>>,
    ready_seen: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> Shared {
        Shared {
            conn_state: RwLock::new(ConnState::Disconnected),
            sender: RwLock::new(None),
            ready_seen: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        *self.conn_state.read()
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        *self.conn_state.write() = state;
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state() == ConnState::Alive
    }

    pub(crate) fn sender(&self) -> Option<Sender> {
        self.sender.read().clone()
    }

    pub(crate) fn set_sender(&self, sender: Option<Sender>) {
        *self.sender.write() = sender;
    }

    pub(crate) fn mark_ready(&self) {
        self.ready_seen.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_ready(&self) -> bool {
        self.ready_seen.swap(false, Ordering::SeqCst)
    }
}

/// The `state` operation's result shape: connection flag, current nick, and
/// channel membership with per-user mode strings (`null` when modeless).
#[derive(Debug, Serialize)]
pub struct StateSummary {
    pub connected: bool,
    pub nick: String,
    pub channels: HashMap<String, HashMap<String, Option<String>>>,
}

/// The `comprehensive_state` operation's result shape.
#[derive(Debug, Serialize)]
pub struct FullState {
    pub server: ServerInfo,
    pub channels: HashMap<String, ChannelState>,
    pub users: HashMap<String, UserInfo>,
    pub stats: Vec<StatEntry>,
    pub recent_errors: Vec<IrcError>,
    pub timestamp: i64,
}

/// A LIST result, possibly partial when the wait timed out.
#[derive(Debug, Serialize)]
pub struct ListOutcome {
    pub channels: Vec<ListEntry>,
    #[serde(skip)]
    pub timed_out: bool,
}

/// A WHOIS result, possibly partial when the wait timed out.
#[derive(Debug)]
pub struct WhoisOutcome {
    pub data: Map<String, Value>,
    pub timed_out: bool,
}

/// The daemon core. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

struct CoreInner {
    config: Arc<Config>,
    state: Arc<StateStore>,
    pending: Arc<PendingTable>,
    fanout: Arc<Dispatcher>,
    shared: Arc<Shared>,
    flood: FloodPolicy,
    stop_tx: watch::Sender<bool>,
}

impl Core {
    /// Validates the configuration and builds an idle core. Call [`run`] to
    /// start connecting.
    ///
    /// [`run`]: Core::run
    pub fn new(config: Config) -> Result<Core> {
        config.validate()?;
        let flood = FloodPolicy::from_config(&config);
        let fanout = Arc::new(Dispatcher::from_config(&config));
        let (stop_tx, _) = watch::channel(false);
        Ok(Core {
            inner: Arc::new(CoreInner {
                config: Arc::new(config),
                state: Arc::new(StateStore::new()),
                pending: Arc::new(PendingTable::new()),
                fanout,
                shared: Arc::new(Shared::new()),
                flood,
                stop_tx,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Runs the supervised connection loop until [`stop`] is called.
    ///
    /// [`stop`]: Core::stop
    pub async fn run(&self) {
        let stop = self.inner.stop_tx.subscribe();
        let inner = self.inner.clone();
        supervisor::supervise(stop, self.inner.shared.clone(), move || {
            let inner = inner.clone();
            async move { inner.run_connection().await }
        })
        .await;
        self.inner.shared.set_sender(None);
        self.inner.shared.set_state(ConnState::Disconnected);
    }

    /// Sends QUIT on an alive connection and stops the supervisor.
    pub async fn stop(&self) {
        if self.inner.shared.is_alive() {
            self.inner.shared.set_state(ConnState::Draining);
            if let Some(sender) = self.inner.shared.sender() {
                let _ = sender.send_line("QUIT :shutting down").await;
                sender.shutdown().await;
            }
        }
        let _ = self.inner.stop_tx.send(true);
    }

    /// A receiver on the stop signal, for sibling tasks (the control server)
    /// that should wind down with the core.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.inner.stop_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.shared.is_alive()
    }

    // --- read-only snapshots ------------------------------------------------

    pub fn state_summary(&self) -> StateSummary {
        let channels = self
            .inner
            .state
            .channels_snapshot()
            .into_iter()
            .map(|(name, chan)| {
                let users = chan
                    .users
                    .into_iter()
                    .map(|(nick, modes)| {
                        (nick, if modes.is_empty() { None } else { Some(modes) })
                    })
                    .collect();
                (name, users)
            })
            .collect();
        StateSummary {
            connected: self.is_connected(),
            nick: self.inner.state.current_nick(),
            channels,
        }
    }

    pub fn server_info(&self) -> ServerInfo {
        self.inner.state.server_snapshot()
    }

    pub fn users(&self) -> HashMap<String, UserInfo> {
        self.inner.state.users_snapshot()
    }

    pub fn user(&self, nick: &str) -> Result<UserInfo> {
        self.inner
            .state
            .user_snapshot(nick)
            .ok_or_else(|| Error::NotFound(format!("no tracked user {}", nick)))
    }

    pub fn stats(&self) -> Vec<StatEntry> {
        self.inner.state.stats_snapshot()
    }

    pub fn errors(&self) -> Vec<IrcError> {
        self.inner.state.errors_snapshot()
    }

    pub fn channel(&self, name: &str) -> Result<ChannelState> {
        self.inner
            .state
            .channel_snapshot(name)
            .ok_or_else(|| Error::NotFound(format!("no tracked channel {}", name)))
    }

    pub fn full_state(&self) -> FullState {
        FullState {
            server: self.inner.state.server_snapshot(),
            channels: self.inner.state.channels_snapshot(),
            users: self.inner.state.users_snapshot(),
            stats: self.inner.state.stats_snapshot(),
            recent_errors: self.inner.state.errors_snapshot(),
            timestamp: Utc::now().timestamp(),
        }
    }

    // --- imperative operations ----------------------------------------------

    fn alive_sender(&self) -> Result<Sender> {
        if !self.inner.shared.is_alive() {
            return Err(Error::NotConnected);
        }
        self.inner.shared.sender().ok_or(Error::NotConnected)
    }

    pub async fn join(&self, channel: &str) -> Result<()> {
        if channel.is_empty() {
            return Err(Error::BadInput("channel is required".into()));
        }
        self.alive_sender()?
            .send_line(format!("JOIN {}", channel))
            .await
    }

    pub async fn part(&self, channel: &str, reason: Option<&str>) -> Result<()> {
        if channel.is_empty() {
            return Err(Error::BadInput("channel is required".into()));
        }
        let line = match reason {
            Some(reason) if !reason.is_empty() => format!("PART {} :{}", channel, reason),
            _ => format!("PART {}", channel),
        };
        self.alive_sender()?.send_line(line).await
    }

    /// Sends a PRIVMSG, applying newline splitting, payload chunking, and
    /// the flood-protection paste diversion for protected channels.
    pub async fn send_privmsg(&self, target: &str, message: &str) -> Result<()> {
        if target.is_empty() || message.is_empty() {
            return Err(Error::BadInput("target and message are required".into()));
        }
        let sender = self.alive_sender()?;
        let lines = split_message(message);

        let paste_command = self.inner.flood.paste_command.as_deref();
        if let Some(template) =
            paste_command.filter(|_| self.inner.flood.should_divert(target, lines.len()))
        {
            let threshold = self.inner.flood.line_threshold;
            for line in &lines[..threshold] {
                sender
                    .send_line(format!("PRIVMSG {} :{}", target, line))
                    .await?;
            }
            match run_paste_command(template, message).await {
                Ok(url) => {
                    sender
                        .send_line(format!("PRIVMSG {} :full message: {}", target, url))
                        .await?;
                }
                Err(err) => {
                    log::warn!("paste service failed, sending untruncated: {}", err);
                    for line in &lines[threshold..] {
                        sender
                            .send_line(format!("PRIVMSG {} :{}", target, line))
                            .await?;
                    }
                }
            }
            return Ok(());
        }

        for line in &lines {
            sender
                .send_line(format!("PRIVMSG {} :{}", target, line))
                .await?;
        }
        Ok(())
    }

    pub async fn send_notice(&self, target: &str, message: &str) -> Result<()> {
        if target.is_empty() || message.is_empty() {
            return Err(Error::BadInput("target and message are required".into()));
        }
        let sender = self.alive_sender()?;
        for line in split_message(message) {
            sender
                .send_line(format!("NOTICE {} :{}", target, line))
                .await?;
        }
        Ok(())
    }

    /// Emits a raw line verbatim (the CRLF is appended by the codec).
    pub async fn send_raw(&self, line: &str) -> Result<()> {
        if line.trim().is_empty() {
            return Err(Error::BadInput("line is required".into()));
        }
        self.alive_sender()?.send_line(line).await
    }

    pub async fn set_nick(&self, nick: &str) -> Result<()> {
        if nick.is_empty() {
            return Err(Error::BadInput("nick is required".into()));
        }
        let sender = self.alive_sender()?;
        let nick = sanitize_nick(nick);
        self.inner
            .state
            .with_identity_mut(|id| id.nick = nick.clone());
        sender.send_line(format!("NICK {}", nick)).await
    }

    /// Runs a LIST: registers a pending request, emits the command, and
    /// waits up to [`CALLER_WAIT`] for the 323 terminator. The accumulator
    /// comes back even when the wait times out.
    pub async fn list(&self) -> Result<ListOutcome> {
        let sender = self.alive_sender()?;
        let (id, done) = self.inner.pending.create(RequestKind::List, "");
        self.spawn_expiry(id);
        sender.send_line("LIST").await?;

        let timed_out = tokio::time::timeout(CALLER_WAIT, done).await.is_err();
        let channels = match self.inner.pending.take(id) {
            Some(RequestData::List(entries)) => entries,
            _ => Vec::new(),
        };
        Ok(ListOutcome {
            channels,
            timed_out,
        })
    }

    /// Runs a WHOIS for `nick`, returning the structured projection plus the
    /// ordered raw entries. Partial on timeout, like [`list`](Core::list).
    pub async fn whois(&self, nick: &str) -> Result<WhoisOutcome> {
        if nick.is_empty() {
            return Err(Error::BadInput("nick is required".into()));
        }
        let sender = self.alive_sender()?;
        let (id, done) = self.inner.pending.create(RequestKind::Whois, nick);
        self.spawn_expiry(id);
        sender.send_line(format!("WHOIS {}", nick)).await?;

        let timed_out = tokio::time::timeout(CALLER_WAIT, done).await.is_err();
        let entries = match self.inner.pending.take(id) {
            Some(RequestData::Whois(entries)) => entries,
            _ => Vec::new(),
        };
        Ok(WhoisOutcome {
            data: whois_structured(nick, &entries),
            timed_out,
        })
    }

    fn spawn_expiry(&self, id: u64) {
        let pending = self.inner.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REQUEST_LIFETIME).await;
            pending.expire(id);
        });
    }
}

impl CoreInner {
    /// One dial-and-serve cycle: connect, register, and pump the read loop
    /// until the socket closes.
    async fn run_connection(self: &Arc<Self>) -> Result<()> {
        self.shared.set_state(ConnState::Dialing);
        let connection = match Connection::dial(&self.config).await {
            Ok(connection) => connection,
            Err(err) => {
                self.shared.set_state(ConnState::Disconnected);
                return Err(err);
            }
        };
        let Connection { mut reader, sender } = connection;

        self.state.reset_connection_state();
        self.shared.set_state(ConnState::Registering);
        self.shared.set_sender(Some(sender.clone()));

        let registration = Arc::new(Registration::new());
        let engine = Engine::new(
            self.config.clone(),
            self.state.clone(),
            self.pending.clone(),
            self.fanout.clone(),
            self.shared.clone(),
            registration.clone(),
            sender.clone(),
        );

        let mut registration_driver = Box::pin(run_registration(
            &self.config,
            &sender,
            &registration,
            &self.state,
        ));
        let mut registering = true;

        loop {
            tokio::select! {
                result = &mut registration_driver, if registering => {
                    registering = false;
                    if let Err(err) = result {
                        log::warn!("registration failed: {}", err);
                        break;
                    }
                }
                item = reader.next() => match item {
                    Some(Ok(line)) => { engine.handle_line(&line).await; eprintln!("DEBUG handled line, looping"); }
                    Some(Err(err)) => {
                        log::warn!("read error: {}", err);
                        break;
                    }
                    None => {
                        log::info!("connection closed by server");
                        break;
                    }
                },
            }
        }

        self.shared.set_sender(None);
        self.shared.set_state(ConnState::Disconnected);
        Ok(())
    }
}
