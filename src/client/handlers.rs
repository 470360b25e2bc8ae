//! The protocol engine: dispatches every parsed message to its handler,
//! mutating tracked state, feeding pending requests, and emitting fan-out
//! events.
//!
//! Handler failures are contained here; nothing in this module can take
//! down the read loop. Unparsable lines are logged and skipped.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use parking_lot::RwLock;
use regex::Regex;

use crate::client::handshake::{sanitize_nick, sasl_plain_payload, Registration, SaslState};
use crate::client::pending::{ListEntry, PendingTable, WhoisEntry};
use crate::client::state::{IrcError, MaskEntry, StatEntry, StateStore};
use crate::client::{ConnState, Shared};
use crate::client::conn::Sender;
use crate::config::Config;
use crate::error::Result;
use crate::fanout::{Dispatcher, Event, EventType};
use crate::proto::{ChannelExt, Message};

/// Compiles a literal extraction pattern once, on first use.
macro_rules! static_regex {
    ($pattern:literal) => {{
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new($pattern).unwrap())
    }};
}

/// Word-boundary nick matcher with the ignore-char guard. The pattern is
/// rebuilt only when the nick changes.
pub(crate) struct MentionMatcher {
    compiled: RwLock<Option<(String, Regex)>>,
    ignore: Vec<char>,
}

impl MentionMatcher {
    pub(crate) fn new(ignore: Vec<char>) -> MentionMatcher {
        MentionMatcher {
            compiled: RwLock::new(None),
            ignore,
        }
    }

    /// True if `text` mentions `nick` as a whole word at least once without
    /// an ignore char directly on either side of the match.
    pub(crate) fn is_mention(&self, nick: &str, text: &str) -> bool {
        let stale = self
            .compiled
            .read()
            .as_ref()
            .map(|(cached, _)| cached != nick)
            .unwrap_or(true);
        if stale {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(nick));
            match Regex::new(&pattern) {
                Ok(regex) => *self.compiled.write() = Some((nick.to_owned(), regex)),
                Err(err) => {
                    log::warn!("mention pattern for {:?} failed to compile: {}", nick, err);
                    return false;
                }
            }
        }

        let guard = self.compiled.read();
        let (_, regex) = guard.as_ref().expect("compiled above");
        for found in regex.find_iter(text) {
            let before = text[..found.start()].chars().next_back();
            let after = text[found.end()..].chars().next();
            let guarded = before.map(|c| self.ignore.contains(&c)).unwrap_or(false)
                || after.map(|c| self.ignore.contains(&c)).unwrap_or(false);
            if !guarded {
                return true;
            }
        }
        false
    }
}

/// One per connection: owns that connection's sender and registration state
/// alongside the long-lived stores.
pub(crate) struct Engine {
    pub(crate) config: Arc<Config>,
    pub(crate) state: Arc<StateStore>,
    pub(crate) pending: Arc<PendingTable>,
    pub(crate) fanout: Arc<Dispatcher>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) registration: Arc<Registration>,
    pub(crate) sender: Sender,
    pub(crate) mention: MentionMatcher,
    #[cfg(test)]
    pub(crate) event_probe: Option<tokio::sync::mpsc::UnboundedSender<Event>>,
}

impl Engine {
    pub(crate) fn new(
        config: Arc<Config>,
        state: Arc<StateStore>,
        pending: Arc<PendingTable>,
        fanout: Arc<Dispatcher>,
        shared: Arc<Shared>,
        registration: Arc<Registration>,
        sender: Sender,
    ) -> Engine {
        let mention = MentionMatcher::new(config.mention_ignore_chars.clone());
        Engine {
            config,
            state,
            pending,
            fanout,
            shared,
            registration,
            sender,
            mention,
            #[cfg(test)]
            event_probe: None,
        }
    }

    fn me(&self) -> String {
        self.state.current_nick()
    }

    fn is_me(&self, nick: &str) -> bool {
        nick.eq_ignore_ascii_case(&self.me())
    }

    fn emit(&self, event: Event) {
        #[cfg(test)]
        if let Some(probe) = &self.event_probe {
            let _ = probe.send(event.clone());
        }
        self.fanout.dispatch(event);
    }

    /// Entry point for the read loop. Never fails.
    pub(crate) async fn handle_line(&self, line: &str) {
        eprintln!("DEBUG line={:?}", line);
        log::trace!("<< {}", line);
        let msg = match Message::parse(line) {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!("skipping unparsable line {:?}: {}", line, err);
                return;
            }
        };
        if let Err(err) = self.handle(&msg).await {
            log::warn!("handler for {} failed: {}", msg.command, err);
        }
    }

    async fn handle(&self, msg: &Message) -> Result<()> {
        if let Some(code) = msg.numeric() {
            return self.handle_numeric(code, msg).await;
        }
        match msg.command.as_str() {
            "PING" => {
                let payload = msg.trailing.as_deref().or(msg.arg(0)).unwrap_or("");
                self.sender.send_line(format!("PONG :{}", payload)).await?;
            }
            "CAP" => self.handle_cap(msg).await?,
            "AUTHENTICATE" => self.handle_authenticate(msg).await?,
            "JOIN" => self.handle_join(msg).await?,
            "PART" => self.handle_part(msg),
            "KICK" => self.handle_kick(msg),
            "QUIT" => self.handle_quit(msg),
            "NICK" => self.handle_nick(msg),
            "MODE" => self.handle_mode(msg),
            "TOPIC" => self.handle_topic(msg),
            "PRIVMSG" => self.handle_privmsg(msg).await?,
            "NOTICE" => self.handle_notice(msg),
            "ERROR" => {
                log::warn!("server error: {}", msg.trailing_or_empty());
            }
            other => {
                log::debug!("ignoring command {}", other);
            }
        }
        Ok(())
    }

    // --- registration ------------------------------------------------------

    async fn handle_cap(&self, msg: &Message) -> Result<()> {
        let subcommand = msg.arg(1).unwrap_or("");
        let caps = msg.trailing_or_empty();
        match subcommand {
            "ACK" => {
                let acked_sasl = caps.split_whitespace().any(|c| c == "sasl");
                if acked_sasl && self.registration.sasl_state() == SaslState::Requested {
                    self.registration.set_sasl_state(SaslState::InProgress);
                    self.sender.send_line("AUTHENTICATE PLAIN").await?;
                } else {
                    // An ACK without sasl while we wanted it means the
                    // negotiation is over; wake the registration driver
                    // instead of letting it sit out the SASL timeout.
                    if self.registration.sasl_state() == SaslState::Requested {
                        self.registration.signal_outcome(SaslState::Aborted);
                    }
                    if self.registration.sasl_state() != SaslState::InProgress {
                        self.sender.send_line("CAP END").await?;
                    }
                }
            }
            "NAK" => {
                if self.registration.sasl_state() == SaslState::Requested {
                    self.registration.signal_outcome(SaslState::Aborted);
                }
                self.sender.send_line("CAP END").await?;
            }
            _ => {
                log::debug!("CAP {} ignored", subcommand);
            }
        }
        Ok(())
    }

    async fn handle_authenticate(&self, msg: &Message) -> Result<()> {
        let challenge = msg.arg(0).or(msg.trailing.as_deref()).unwrap_or("");
        if challenge != "+" {
            return Ok(());
        }
        if let Some((user, pass)) = self.config.sasl_credentials() {
            self.sender
                .send_line(format!("AUTHENTICATE {}", sasl_plain_payload(user, pass)))
                .await?;
        }
        Ok(())
    }

    async fn handle_welcome(&self, msg: &Message) -> Result<()> {
        if let Some(confirmed) = msg.arg(0) {
            self.state
                .with_identity_mut(|id| id.nick = confirmed.to_owned());
        }
        self.shared.set_state(ConnState::Alive);
        self.shared.mark_ready();
        log::info!("registered as {}", self.me());

        self.sender
            .send_line(format!("MODE {} +B", self.me()))
            .await?;
        for channel in &self.config.autojoin {
            self.sender.send_line(format!("JOIN {}", channel)).await?;
        }
        Ok(())
    }

    async fn handle_nick_collision(&self) -> Result<()> {
        let current = self.me();
        let mut renamed = sanitize_nick(&format!("{}_", current));
        if renamed == current {
            // At the length cap the underscore gets truncated away; force it.
            renamed.pop();
            renamed.push('_');
        }
        log::warn!("nick {} in use, trying {}", current, renamed);
        self.state
            .with_identity_mut(|id| id.nick = renamed.clone());
        self.sender.send_line(format!("NICK {}", renamed)).await?;
        Ok(())
    }

    // --- channel membership ------------------------------------------------

    async fn handle_join(&self, msg: &Message) -> Result<()> {
        let channel = msg.arg(0).or(msg.trailing.as_deref()).unwrap_or("");
        let nick = match msg.source_nick() {
            Some(nick) => nick.to_owned(),
            None => return Ok(()),
        };
        if channel.is_empty() {
            return Ok(());
        }
        if self.is_me(&nick) {
            log::info!("joined {}", channel);
            self.state.create_channel(channel);
            self.state
                .with_channel_mut(channel, |c| c.set_user(&nick, ""));
            self.sender.send_line(format!("NAMES {}", channel)).await?;
        } else {
            self.state
                .with_channel_mut(channel, |c| c.set_user(&nick, ""));
            self.emit(
                Event::new(EventType::Join, &nick, channel, "", &self.me())
                    .with_tags(msg.tag_map()),
            );
        }
        Ok(())
    }

    fn handle_part(&self, msg: &Message) {
        let channel = msg.arg(0).or(msg.trailing.as_deref()).unwrap_or("");
        let nick = match msg.source_nick() {
            Some(nick) => nick.to_owned(),
            None => return,
        };
        if self.is_me(&nick) {
            log::info!("parted {}", channel);
            self.state.remove_channel(channel);
            return;
        }
        self.state
            .with_channel_mut(channel, |c| c.remove_user(&nick));
        self.state
            .drop_user_if_orphaned(&nick, self.pending.has_whois_for(&nick));
        self.emit(
            Event::new(
                EventType::Part,
                &nick,
                channel,
                msg.trailing_or_empty(),
                &self.me(),
            )
            .with_tags(msg.tag_map()),
        );
    }

    fn handle_kick(&self, msg: &Message) {
        let channel = msg.arg(0).unwrap_or("");
        let victim = msg.arg(1).unwrap_or("");
        let kicker = msg.source_nick().unwrap_or("").to_owned();
        let reason = msg.trailing_or_empty();
        if self.is_me(victim) {
            log::warn!("kicked from {} by {}: {}", channel, kicker, reason);
            self.state.remove_channel(channel);
            return;
        }
        self.state
            .with_channel_mut(channel, |c| c.remove_user(victim));
        self.state
            .drop_user_if_orphaned(victim, self.pending.has_whois_for(victim));
        let message = format!("{} kicked {}: {}", kicker, victim, reason);
        self.emit(
            Event::new(EventType::Kick, &kicker, channel, &message, &self.me())
                .with_chat_input(reason)
                .with_tags(msg.tag_map()),
        );
    }

    fn handle_quit(&self, msg: &Message) {
        let nick = match msg.source_nick() {
            Some(nick) => nick.to_owned(),
            None => return,
        };
        self.state.remove_user_from_all_channels(&nick);
        self.state
            .drop_user_if_orphaned(&nick, self.pending.has_whois_for(&nick));
        self.emit(
            Event::new(
                EventType::Quit,
                &nick,
                "",
                msg.trailing_or_empty(),
                &self.me(),
            )
            .with_tags(msg.tag_map()),
        );
    }

    fn handle_nick(&self, msg: &Message) {
        let old = match msg.source_nick() {
            Some(nick) => nick.to_owned(),
            None => return,
        };
        let new = msg
            .arg(0)
            .or(msg.trailing.as_deref())
            .unwrap_or("")
            .to_owned();
        if new.is_empty() {
            return;
        }
        if self.is_me(&old) {
            self.state.with_identity_mut(|id| id.nick = new.clone());
            log::info!("nick changed to {}", new);
        }
        self.state.rename_user_in_channels(&old, &new);
        self.state.rename_user(&old, &new);
    }

    // --- channel attributes -------------------------------------------------

    fn handle_mode(&self, msg: &Message) {
        let target = msg.arg(0).unwrap_or("");
        if !target.is_channel_name() {
            // User-target MODE: just record the raw form.
            if !target.is_empty() {
                let raw = msg.args.get(1..).unwrap_or(&[]).join(" ");
                self.state.with_user_mut(target, |u| u.modes = raw);
            }
            return;
        }

        let modestring = msg.arg(1).unwrap_or("");
        let mut params = msg.args.get(2..).unwrap_or(&[]).iter().map(String::as_str);
        let mut adding = true;
        self.state.with_channel_mut(target, |chan| {
            for letter in modestring.chars() {
                match letter {
                    '+' => adding = true,
                    '-' => adding = false,
                    'o' | 'v' | 'h' => {
                        if let Some(nick) = params.next() {
                            if adding {
                                chan.add_user_mode(nick, letter);
                            } else {
                                chan.remove_user_mode(nick, letter);
                            }
                        }
                    }
                    'b' | 'k' | 'l' => {
                        let _ = params.next();
                    }
                    other => {
                        if adding {
                            if !chan.modes.contains(other) {
                                chan.modes.push(other);
                            }
                        } else {
                            chan.modes.retain(|c| c != other);
                        }
                    }
                }
            }
        });

        let setter = msg.source_nick().unwrap_or("").to_owned();
        let description = {
            let mut parts = vec![modestring.to_owned()];
            parts.extend(msg.args.get(2..).unwrap_or(&[]).iter().cloned());
            parts.join(" ")
        };
        self.emit(
            Event::new(EventType::Mode, &setter, target, &description, &self.me())
                .with_tags(msg.tag_map()),
        );
    }

    fn handle_topic(&self, msg: &Message) {
        let channel = msg.arg(0).unwrap_or("");
        let topic = msg.trailing_or_empty().to_owned();
        let setter = msg.source_nick().unwrap_or("").to_owned();
        self.state.with_channel_mut(channel, |chan| {
            chan.topic = topic.clone();
            chan.topic_set_by = setter.clone();
            chan.topic_set_time = Utc::now().timestamp() as u64;
        });
        self.emit(
            Event::new(EventType::Topic, &setter, channel, &topic, &self.me())
                .with_tags(msg.tag_map()),
        );
    }

    // --- chat ---------------------------------------------------------------

    async fn handle_privmsg(&self, msg: &Message) -> Result<()> {
        let target = msg.arg(0).unwrap_or("").to_owned();
        let text = msg.trailing_or_empty().to_owned();
        let sender = msg.source_nick().unwrap_or("").to_owned();
        let me = self.me();

        self.reply_ctcp(&sender, &text).await?;

        self.emit(
            Event::new(EventType::Privmsg, &sender, &target, &text, &me)
                .with_tags(msg.tag_map()),
        );

        if !sender.eq_ignore_ascii_case(&me) && self.mention.is_mention(&me, &text) {
            self.emit(
                Event::new(EventType::Mention, &sender, &target, &text, &me)
                    .with_tags(msg.tag_map()),
            );
        }
        Ok(())
    }

    /// Answers CTCP VERSION and PING queries with the customary NOTICE.
    async fn reply_ctcp(&self, sender: &str, text: &str) -> Result<()> {
        let Some(body) = text
            .strip_prefix('\u{1}')
            .and_then(|t| t.strip_suffix('\u{1}'))
        else {
            return Ok(());
        };
        if sender.is_empty() {
            return Ok(());
        }
        if body == "VERSION" {
            self.sender
                .send_line(format!(
                    "NOTICE {} :\u{1}VERSION ircship {}\u{1}",
                    sender,
                    env!("CARGO_PKG_VERSION")
                ))
                .await?;
        } else if let Some(payload) = body.strip_prefix("PING") {
            self.sender
                .send_line(format!("NOTICE {} :\u{1}PING{}\u{1}", sender, payload))
                .await?;
        }
        Ok(())
    }

    fn handle_notice(&self, msg: &Message) {
        let target = msg.arg(0).unwrap_or("");
        let sender = msg.source_nick().unwrap_or("");
        self.emit(
            Event::new(
                EventType::Notice,
                sender,
                target,
                msg.trailing_or_empty(),
                &self.me(),
            )
            .with_tags(msg.tag_map()),
        );
    }

    // --- numerics -----------------------------------------------------------

    async fn handle_numeric(&self, code: u16, msg: &Message) -> Result<()> {
        match code {
            1 => self.handle_welcome(msg).await?,
            2 => {
                let re = static_regex!(r"Your host is ([^,]+),? running version (.+)");
                if let Some(caps) = re.captures(msg.trailing_or_empty()) {
                    self.state.with_server_mut(|s| {
                        s.name = caps[1].trim().to_owned();
                        s.version = caps[2].trim().to_owned();
                    });
                }
            }
            3 => {
                let re = static_regex!(r"This server was created (.+)");
                if let Some(caps) = re.captures(msg.trailing_or_empty()) {
                    self.state
                        .with_server_mut(|s| s.created = caps[1].trim().to_owned());
                }
            }
            4 => self.state.with_server_mut(|s| {
                if let Some(name) = msg.arg(1) {
                    s.name = name.to_owned();
                }
                if let Some(version) = msg.arg(2) {
                    s.version = version.to_owned();
                }
                if let Some(user_modes) = msg.arg(3) {
                    s.user_modes = user_modes.to_owned();
                }
                if let Some(channel_modes) = msg.arg(4) {
                    s.channel_modes = channel_modes.to_owned();
                }
            }),
            5 => self.state.with_server_mut(|s| {
                for token in msg.args.get(1..).unwrap_or(&[]) {
                    match token.split_once('=') {
                        Some((key, value)) => {
                            s.isupport.insert(key.to_owned(), value.to_owned());
                        }
                        None => {
                            s.isupport.insert(token.clone(), String::new());
                        }
                    }
                }
            }),

            251 => {
                let re = static_regex!(r"(\d+) users and (\d+) invisible on (\d+) servers");
                if let Some(caps) = re.captures(msg.trailing_or_empty()) {
                    let visible: u64 = caps[1].parse().unwrap_or(0);
                    let invisible: u64 = caps[2].parse().unwrap_or(0);
                    self.state
                        .with_server_mut(|s| s.global_users = visible + invisible);
                }
            }
            252 => self
                .state
                .with_server_mut(|s| s.operators = parse_count(msg.arg(1))),
            253 => self
                .state
                .with_server_mut(|s| s.unknown_connections = parse_count(msg.arg(1))),
            254 => self
                .state
                .with_server_mut(|s| s.channels_formed = parse_count(msg.arg(1))),
            255 => {
                let re = static_regex!(r"I have (\d+) clients and (\d+) servers");
                if let Some(caps) = re.captures(msg.trailing_or_empty()) {
                    self.state
                        .with_server_mut(|s| s.local_users = caps[1].parse().unwrap_or(0));
                }
            }
            256 => self.state.with_server_mut(|s| {
                s.admin.server = msg
                    .arg(1)
                    .map(str::to_owned)
                    .unwrap_or_else(|| msg.trailing_or_empty().to_owned());
            }),
            257 => self
                .state
                .with_server_mut(|s| s.admin.location1 = msg.trailing_or_empty().to_owned()),
            258 => self
                .state
                .with_server_mut(|s| s.admin.location2 = msg.trailing_or_empty().to_owned()),
            259 => self
                .state
                .with_server_mut(|s| s.admin.email = msg.trailing_or_empty().to_owned()),
            265 => self.state.with_server_mut(|s| {
                s.local_users = parse_count(msg.arg(1));
                s.max_local_users = parse_count(msg.arg(2));
            }),
            266 => self.state.with_server_mut(|s| {
                s.global_users = parse_count(msg.arg(1));
                s.max_global_users = parse_count(msg.arg(2));
            }),

            371 => self
                .state
                .with_server_mut(|s| s.motd.push(msg.trailing_or_empty().to_owned())),
            375 => self.state.with_server_mut(|s| s.motd.clear()),
            372 => self.state.with_server_mut(|s| {
                let line = msg.trailing_or_empty();
                let line = line.strip_prefix("- ").unwrap_or(line);
                s.motd.push(line.to_owned());
            }),
            376 => log::debug!("end of MOTD"),

            // LIST
            322 => {
                let entry = ListEntry {
                    channel: msg.arg(1).unwrap_or("").to_owned(),
                    users: parse_count(msg.arg(2)),
                    topic: msg.trailing_or_empty().to_owned(),
                };
                if !self.pending.push_list_entry(entry) {
                    log::debug!("dropping 322 with no pending LIST");
                }
            }
            323 => {
                if !self.pending.complete_list() {
                    log::debug!("dropping 323 with no pending LIST");
                }
            }

            // WHOIS
            311 => {
                let nick = msg.arg(1).unwrap_or("");
                let user = msg.arg(2).unwrap_or("").to_owned();
                let host = msg.arg(3).unwrap_or("").to_owned();
                let real_name = msg.trailing_or_empty().to_owned();
                self.state.with_user_mut(nick, |u| {
                    u.user = user.clone();
                    u.host = host.clone();
                    u.real_name = real_name.clone();
                });
                self.pending.push_whois_entry(
                    nick,
                    WhoisEntry::User {
                        user,
                        host,
                        real_name,
                    },
                );
            }
            312 => {
                let nick = msg.arg(1).unwrap_or("");
                let server = msg.arg(2).unwrap_or("").to_owned();
                let server_info = msg.trailing_or_empty().to_owned();
                self.state.with_user_mut(nick, |u| {
                    u.server = server.clone();
                    u.server_info = server_info.clone();
                });
                self.pending.push_whois_entry(
                    nick,
                    WhoisEntry::Server {
                        server,
                        server_info,
                    },
                );
            }
            313 => {
                let nick = msg.arg(1).unwrap_or("");
                self.state.with_user_mut(nick, |u| u.is_operator = true);
                self.pending.push_whois_entry(
                    nick,
                    WhoisEntry::Operator {
                        privileges: msg.trailing_or_empty().to_owned(),
                    },
                );
            }
            317 => {
                let nick = msg.arg(1).unwrap_or("");
                let idle = msg.arg(2).unwrap_or("").to_owned();
                let signon = parse_count(msg.arg(3));
                self.state.with_user_mut(nick, |u| {
                    u.idle_seconds = idle.parse().unwrap_or(0);
                    if signon > 0 {
                        u.signon_time = signon;
                    }
                });
                self.pending.push_whois_entry(
                    nick,
                    WhoisEntry::Idle {
                        idle_seconds: idle,
                        idle_info: msg.trailing_or_empty().to_owned(),
                    },
                );
            }
            318 => {
                let nick = msg.arg(1).unwrap_or("");
                if !self.pending.complete_whois(nick) {
                    log::debug!("dropping 318 for {} with no pending WHOIS", nick);
                }
            }
            319 => {
                let nick = msg.arg(1).unwrap_or("");
                let channels = msg.trailing_or_empty().to_owned();
                self.state
                    .with_user_mut(nick, |u| u.channels = channels.clone());
                self.pending
                    .push_whois_entry(nick, WhoisEntry::Channels { channels });
            }

            // Channel attributes
            324 => {
                let channel = msg.arg(1).unwrap_or("");
                let modes = msg.arg(2).unwrap_or("").to_owned();
                let params: Vec<String> = msg.args.get(3..).unwrap_or(&[]).to_vec();
                self.state.with_channel_mut(channel, |chan| {
                    chan.modes = modes;
                    chan.mode_params = params;
                });
            }
            325 => {
                // Dual-purpose: channel unique-op vs WHOIS WebIRC, told apart
                // by the shape of the second argument.
                let subject = msg.arg(1).unwrap_or("");
                if subject.is_channel_name() {
                    let value = msg
                        .arg(2)
                        .map(str::to_owned)
                        .unwrap_or_else(|| msg.trailing_or_empty().to_owned());
                    self.state.with_channel_mut(subject, |chan| {
                        chan.special_info.insert("unique_op".to_owned(), value);
                    });
                } else {
                    let info = msg.trailing_or_empty().to_owned();
                    self.state.with_user_mut(subject, |u| {
                        u.special_info.insert("325".to_owned(), info);
                    });
                }
            }
            328 => {
                let channel = msg.arg(1).unwrap_or("");
                let url = msg.trailing_or_empty().to_owned();
                self.state.with_channel_mut(channel, |chan| chan.url = url);
            }
            329 => {
                let channel = msg.arg(1).unwrap_or("");
                let created = parse_count(msg.arg(2));
                self.state
                    .with_channel_mut(channel, |chan| chan.created_time = created);
            }
            331 => {
                let channel = msg.arg(1).unwrap_or("");
                self.state.with_channel_mut(channel, |chan| {
                    chan.topic.clear();
                    chan.topic_set_by.clear();
                    chan.topic_set_time = 0;
                });
            }
            332 => {
                let channel = msg.arg(1).unwrap_or("");
                let topic = msg.trailing_or_empty().to_owned();
                self.state
                    .with_channel_mut(channel, |chan| chan.topic = topic);
            }
            333 => {
                let channel = msg.arg(1).unwrap_or("");
                let set_by = msg.arg(2).unwrap_or("").to_owned();
                let set_time = parse_count(msg.arg(3));
                self.state.with_channel_mut(channel, |chan| {
                    chan.topic_set_by = set_by;
                    chan.topic_set_time = set_time;
                });
            }

            // Mask lists. Some servers put the mask in the trailing with no
            // further fields; that form carries no set_by/set_time/reason.
            346 | 348 | 367 => {
                let channel = msg.arg(1).unwrap_or("");
                let entry = mask_entry(msg);
                self.state.with_channel_mut(channel, |chan| {
                    let list = match code {
                        346 => &mut chan.invite_list,
                        348 => &mut chan.except_list,
                        _ => &mut chan.ban_list,
                    };
                    list.push(entry);
                });
            }
            347 | 349 | 368 => {
                log::debug!("end of mask list for {}", msg.arg(1).unwrap_or("?"));
            }

            // NAMES
            353 => {
                let channel = msg.arg(2).unwrap_or("");
                let names = msg.trailing_or_empty();
                eprintln!("DEBUG 353 channel={:?} names={:?}", channel, names);
                self.state.with_channel_mut(channel, |chan| {
                    for name in names.split_whitespace() {
                        let mut modes = String::new();
                        let mut rest = name;
                        loop {
                            let Some(first) = rest.chars().next() else { break };
                            let letter = match first {
                                '@' => 'o',
                                '+' => 'v',
                                '%' => 'h',
                                _ => break,
                            };
                            if !modes.contains(letter) {
                                modes.push(letter);
                            }
                            rest = &rest[first.len_utf8()..];
                        }
                        if !rest.is_empty() {
                            chan.set_user(rest, &modes);
                        }
                    }
                });
            }
            366 => log::debug!("end of NAMES for {}", msg.arg(1).unwrap_or("?")),

            // User info beyond the WHOIS mains
            276 => {
                let nick = msg.arg(1).unwrap_or("");
                let trailing = msg.trailing_or_empty();
                let re = static_regex!(r"fingerprint (\S+)");
                let fingerprint = re
                    .captures(trailing)
                    .map(|c| c[1].to_owned())
                    .unwrap_or_else(|| trailing.to_owned());
                self.state
                    .with_user_mut(nick, |u| u.cert_fingerprint = fingerprint);
            }
            301 => {
                let nick = msg.arg(1).unwrap_or("");
                let away = msg.trailing_or_empty().to_owned();
                self.state.with_user_mut(nick, |u| {
                    u.is_away = true;
                    u.away_message = away;
                });
            }
            305 => {
                let me = self.me();
                self.state.with_user_mut(&me, |u| {
                    u.is_away = false;
                    u.away_message.clear();
                });
            }
            306 => {
                let me = self.me();
                self.state.with_user_mut(&me, |u| u.is_away = true);
            }
            314 => {
                // WHOWAS: shaped like 311, recorded the same way.
                let nick = msg.arg(1).unwrap_or("");
                let user = msg.arg(2).unwrap_or("").to_owned();
                let host = msg.arg(3).unwrap_or("").to_owned();
                let real_name = msg.trailing_or_empty().to_owned();
                self.state.with_user_mut(nick, |u| {
                    u.user = user;
                    u.host = host;
                    u.real_name = real_name;
                });
            }
            330 => {
                let nick = msg.arg(1).unwrap_or("");
                let account = msg.arg(2).unwrap_or("").to_owned();
                self.state.with_user_mut(nick, |u| u.account = account);
            }
            335 => {
                let nick = msg.arg(1).unwrap_or("");
                self.state.with_user_mut(nick, |u| u.is_bot = true);
            }
            338 => {
                let nick = msg.arg(1).unwrap_or("");
                let trailing = msg.trailing_or_empty();
                let re = static_regex!(r"is actually (.+)");
                let actual = re
                    .captures(trailing)
                    .map(|c| c[1].to_owned())
                    .or_else(|| msg.arg(2).map(str::to_owned))
                    .unwrap_or_default();
                self.state.with_user_mut(nick, |u| u.actual_host = actual);
            }
            344 => {
                let nick = msg.arg(1).unwrap_or("");
                let country_code = msg.arg(2).unwrap_or("").to_owned();
                let re = static_regex!(r"from (.+)$");
                let country = re
                    .captures(msg.trailing_or_empty())
                    .map(|c| c[1].to_owned())
                    .unwrap_or_default();
                self.state.with_user_mut(nick, |u| {
                    u.country_code = country_code;
                    u.country = country;
                });
            }
            350 => {
                let nick = msg.arg(1).unwrap_or("");
                let gateway = msg
                    .arg(2)
                    .map(str::to_owned)
                    .unwrap_or_else(|| msg.trailing_or_empty().to_owned());
                self.state.with_user_mut(nick, |u| u.webirc_gateway = gateway);
            }
            569 => {
                // The ASN arrives either as a middle arg or as the first
                // token of the trailing ("AS64496 Example AS").
                let nick = msg.arg(1).unwrap_or("");
                let asn = msg
                    .arg(2)
                    .or_else(|| {
                        msg.trailing
                            .as_deref()
                            .and_then(|t| t.split_whitespace().next())
                    })
                    .unwrap_or_default()
                    .to_owned();
                self.state.with_user_mut(nick, |u| u.asn = asn);
            }
            671 => {
                let nick = msg.arg(1).unwrap_or("");
                self.state.with_user_mut(nick, |u| u.is_secure = true);
            }
            307 | 308 | 309 | 310 | 320 | 378 | 379 | 396 => {
                let nick = msg.arg(1).unwrap_or("");
                let info = msg.trailing_or_empty().to_owned();
                self.state.with_user_mut(nick, |u| {
                    u.special_info.insert(code.to_string(), info);
                });
            }

            // Registration outcomes
            433 => self.handle_nick_collision().await?,
            900 => {
                let account = msg
                    .arg(2)
                    .map(str::to_owned)
                    .unwrap_or_else(|| msg.trailing_or_empty().to_owned());
                log::info!("logged in as {}", account);
                let me = self.me();
                self.state.with_user_mut(&me, |u| u.account = account.clone());
                self.state
                    .with_identity_mut(|id| id.account = Some(account));
            }
            901 => {
                let me = self.me();
                self.state.with_user_mut(&me, |u| u.account.clear());
                self.state.with_identity_mut(|id| id.account = None);
            }
            902 => {
                // Nick locked: an error in its own right, and a SASL abort
                // when one is in flight.
                self.record_error(code, msg);
                if matches!(
                    self.registration.sasl_state(),
                    SaslState::Requested | SaslState::InProgress
                ) {
                    self.registration.signal_outcome(SaslState::Failed);
                    self.sender.send_line("CAP END").await?;
                }
            }
            903 => {
                log::info!("SASL authentication succeeded");
                self.registration.signal_outcome(SaslState::Succeeded);
                self.sender.send_line("CAP END").await?;
            }
            904 | 905 => {
                log::warn!("SASL authentication failed ({})", code);
                self.registration.signal_outcome(SaslState::Failed);
                self.sender.send_line("CAP END").await?;
            }

            code if is_error_numeric(code) => self.record_error(code, msg),
            code if is_stats_numeric(code) => {
                self.record_stat(format!("stats_{}", code), msg);
            }
            code => {
                log::debug!("unknown numeric {}", code);
                self.record_stat("unknown_numeric".to_owned(), msg);
            }
        }
        Ok(())
    }

    fn record_error(&self, code: u16, msg: &Message) {
        let target = msg.args.get(1..).unwrap_or(&[]).join(" ");
        let entry = IrcError {
            code,
            target,
            message: msg.trailing_or_empty().to_owned(),
            time: Utc::now().timestamp(),
        };
        log::debug!("server error {}: {} {}", code, entry.target, entry.message);
        self.state.push_error(entry);
    }

    fn record_stat(&self, entry_type: String, msg: &Message) {
        let mut fields = HashMap::new();
        fields.insert("code".to_owned(), msg.command.clone());
        for (i, arg) in msg.args.iter().enumerate().skip(1) {
            fields.insert(format!("arg{}", i), arg.clone());
        }
        if let Some(trailing) = &msg.trailing {
            fields.insert("message".to_owned(), trailing.clone());
        }
        self.state.push_stat(StatEntry {
            entry_type,
            fields,
            time: Utc::now().timestamp(),
        });
    }
}

fn parse_count(arg: Option<&str>) -> u64 {
    arg.and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn mask_entry(msg: &Message) -> MaskEntry {
    match msg.arg(2) {
        Some(mask) => MaskEntry {
            mask: mask.to_owned(),
            set_by: msg.arg(3).unwrap_or("").to_owned(),
            set_time: parse_count(msg.arg(4)),
            reason: None,
        },
        // Trailing-only form: the trailing is the mask, not a reason.
        None => MaskEntry {
            mask: msg.trailing_or_empty().to_owned(),
            set_by: String::new(),
            set_time: 0,
            reason: None,
        },
    }
}

/// The error numerics recorded in the errors ring. 433 is deliberately
/// absent; it drives nick-collision recovery instead.
fn is_error_numeric(code: u16) -> bool {
    matches!(code,
        400..=417
        | 421..=424
        | 431
        | 432
        | 436
        | 437
        | 441..=446
        | 451
        | 461..=467
        | 471..=478
        | 481..=485
        | 491
        | 492
        | 501
        | 502
    )
}

/// Informational stats numerics recorded in the stats ring.
fn is_stats_numeric(code: u16) -> bool {
    matches!(code, 211..=219 | 241..=250)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::conn::test_support::{connection_pair, FakeServer};
    use crate::client::handshake::Registration;
    use crate::client::pending::{RequestData, RequestKind};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        engine: Engine,
        server: FakeServer,
        events: UnboundedReceiver<Event>,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fixture_with(tweak: impl FnOnce(&mut Config)) -> Fixture {
        let mut config = Config::default();
        config.server = "irc.test:6667".to_owned();
        config.nick = "bot".to_owned();
        tweak(&mut config);
        let config = Arc::new(config);

        let state = Arc::new(StateStore::new());
        state.with_identity_mut(|id| id.nick = "bot".to_owned());
        let (conn, server) = connection_pair();
        let mut engine = Engine::new(
            config.clone(),
            state,
            Arc::new(PendingTable::new()),
            Arc::new(Dispatcher::from_config(&config)),
            Arc::new(Shared::new()),
            Arc::new(Registration::new()),
            conn.sender,
        );
        let (tx, events) = tokio::sync::mpsc::unbounded_channel();
        engine.event_probe = Some(tx);
        Fixture {
            engine,
            server,
            events,
        }
    }

    impl Fixture {
        async fn feed(&self, lines: &[&str]) {
            for line in lines {
                self.engine.handle_line(line).await;
            }
        }

        fn drain_events(&mut self) -> Vec<Event> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let mut fx = fixture();
        fx.feed(&["PING :abc123"]).await;
        assert_eq!(fx.server.next_line().await.as_deref(), Some("PONG :abc123"));
    }

    #[tokio::test]
    async fn mode_tracking_scenario() {
        // Mirrors the "mode tracking" end-to-end flow: join, NAMES, then a
        // MODE grant for users who are not in the channel.
        let mut fx = fixture();
        fx.feed(&[
            ":s 001 bot :hi",
            ":bot!u@h JOIN :#a",
            ":s 353 bot = #a :bot @alice +bob",
            ":s 366 bot #a :end",
            ":op!u@h MODE #a +ov carol dave",
        ])
        .await;

        let chan = fx.engine.state.channel_snapshot("#a").unwrap();
        assert_eq!(chan.users.len(), 3);
        assert_eq!(chan.users["bot"], "");
        assert_eq!(chan.users["alice"], "o");
        assert_eq!(chan.users["bob"], "v");
        assert!(!chan.has_user("carol"));
        assert!(!chan.has_user("dave"));
        // 001 marked us alive and kicked off MODE +B; JOIN asked for NAMES.
        assert_eq!(fx.engine.shared.state(), ConnState::Alive);
        assert_eq!(fx.server.next_line().await.as_deref(), Some("MODE bot +B"));
        assert_eq!(fx.server.next_line().await.as_deref(), Some("NAMES #a"));
    }

    #[tokio::test]
    async fn mode_grant_and_revoke_round_trip() {
        let mut fx = fixture();
        fx.feed(&[
            ":bot!u@h JOIN :#a",
            ":s 353 bot = #a :walter",
            ":op!u@h MODE #a +ov walter walter",
            ":op!u@h MODE #a -ov walter walter",
        ])
        .await;
        let chan = fx.engine.state.channel_snapshot("#a").unwrap();
        assert_eq!(chan.users["walter"], "");
        let modes: Vec<String> = fx
            .drain_events()
            .into_iter()
            .filter(|e| e.event_type == "mode")
            .map(|e| e.message)
            .collect();
        assert_eq!(modes, vec!["+ov walter walter", "-ov walter walter"]);
    }

    #[tokio::test]
    async fn channel_mode_letters_consume_params_in_order() {
        let mut fx = fixture();
        fx.feed(&[
            ":bot!u@h JOIN :#a",
            ":s 353 bot = #a :x y",
            ":op!u@h MODE #a +klo secret 10 x",
        ])
        .await;
        let chan = fx.engine.state.channel_snapshot("#a").unwrap();
        // k and l each consumed one parameter, so 'o' landed on "x".
        assert_eq!(chan.users["x"], "o");
        assert_eq!(chan.users["y"], "");
    }

    #[tokio::test]
    async fn self_part_and_kick_drop_channel_state() {
        let mut fx = fixture();
        fx.feed(&[":bot!u@h JOIN :#a", ":bot!u@h PART #a :bye"]).await;
        assert!(fx.engine.state.channel_snapshot("#a").is_none());

        fx.feed(&[":bot!u@h JOIN :#b", ":op!u@h KICK #b bot :out"]).await;
        assert!(fx.engine.state.channel_snapshot("#b").is_none());
    }

    #[tokio::test]
    async fn kick_event_carries_formatted_message_and_raw_reason() {
        let mut fx = fixture();
        fx.feed(&[
            ":bot!u@h JOIN :#a",
            ":s 353 bot = #a :victim",
            ":op!u@h KICK #a victim :flooding",
        ])
        .await;
        let chan = fx.engine.state.channel_snapshot("#a").unwrap();
        assert!(!chan.has_user("victim"));
        let kick = fx
            .drain_events()
            .into_iter()
            .find(|e| e.event_type == "kick")
            .unwrap();
        assert_eq!(kick.message, "op kicked victim: flooding");
        assert_eq!(kick.chat_input, "flooding");
        assert_eq!(kick.sender, "op");
        assert_eq!(kick.target, "#a");
    }

    #[tokio::test]
    async fn quit_removes_user_everywhere() {
        let mut fx = fixture();
        fx.feed(&[
            ":bot!u@h JOIN :#a",
            ":bot!u@h JOIN :#b",
            ":s 353 bot = #a :ghost",
            ":s 353 bot = #b :ghost",
            ":ghost!u@h QUIT :gone",
        ])
        .await;
        assert!(!fx.engine.state.channel_snapshot("#a").unwrap().has_user("ghost"));
        assert!(!fx.engine.state.channel_snapshot("#b").unwrap().has_user("ghost"));
        let quit = fx
            .drain_events()
            .into_iter()
            .find(|e| e.event_type == "quit")
            .unwrap();
        assert_eq!(quit.target, "");
        assert_eq!(quit.message, "gone");
    }

    #[tokio::test]
    async fn nick_rename_updates_self_and_channels() {
        let mut fx = fixture();
        fx.feed(&[
            ":bot!u@h JOIN :#a",
            ":s 353 bot = #a :@alice",
            ":alice!u@h NICK :eve",
            ":bot!u@h NICK :bot2",
        ])
        .await;
        let chan = fx.engine.state.channel_snapshot("#a").unwrap();
        assert_eq!(chan.users["eve"], "o");
        assert!(!chan.has_user("alice"));
        assert_eq!(fx.engine.me(), "bot2");
        assert!(chan.has_user("bot2"));
    }

    #[tokio::test]
    async fn empty_names_reply_is_harmless() {
        let fx = fixture();
        fx.feed(&[":bot!u@h JOIN :#a", ":s 353 bot = #a :"]).await;
        let chan = fx.engine.state.channel_snapshot("#a").unwrap();
        assert_eq!(chan.users.len(), 1); // just us
    }

    #[tokio::test]
    async fn mention_respects_ignore_guard() {
        let mut fx = fixture();
        fx.feed(&[":u!u@h PRIVMSG #x :ping /bot/ vs bot!"]).await;
        let events = fx.drain_events();
        let privmsgs = events.iter().filter(|e| e.event_type == "privmsg").count();
        let mentions = events.iter().filter(|e| e.event_type == "mention").count();
        assert_eq!(privmsgs, 1);
        assert_eq!(mentions, 1);
    }

    #[tokio::test]
    async fn fully_guarded_mention_is_suppressed() {
        let mut fx = fixture();
        fx.feed(&[":u!u@h PRIVMSG #x :see /bot/ for docs"]).await;
        let events = fx.drain_events();
        assert!(events.iter().any(|e| e.event_type == "privmsg"));
        assert!(!events.iter().any(|e| e.event_type == "mention"));
    }

    #[tokio::test]
    async fn substring_is_not_a_mention() {
        let mut fx = fixture();
        fx.feed(&[":u!u@h PRIVMSG #x :robots are fine"]).await;
        assert!(!fx
            .drain_events()
            .iter()
            .any(|e| e.event_type == "mention"));
    }

    #[tokio::test]
    async fn mention_is_case_insensitive() {
        let mut fx = fixture();
        fx.feed(&[":u!u@h PRIVMSG #x :hey BOT, you up?"]).await;
        assert!(fx.drain_events().iter().any(|e| e.event_type == "mention"));
    }

    #[tokio::test]
    async fn notice_emits_notice_only() {
        let mut fx = fixture();
        fx.feed(&[":u!u@h NOTICE #x :hello bot"]).await;
        let events = fx.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "notice");
    }

    #[tokio::test]
    async fn whois_burst_routes_to_pending_request() {
        let fx = fixture();
        let (id, _rx) = fx
            .engine
            .pending
            .create(RequestKind::Whois, "testuser");
        fx.feed(&[
            ":s 311 bot testuser johndoe example.com * :John Doe",
            ":s 312 bot testuser irc.x :Loc",
            ":s 313 bot testuser :is an IRC operator",
            ":s 317 bot testuser 42 1600000000 :seconds idle",
            ":s 319 bot testuser :@#ops +#g #r",
            ":s 318 bot testuser :End of WHOIS",
        ])
        .await;
        let data = fx.engine.pending.take(id).unwrap();
        let RequestData::Whois(entries) = data else {
            panic!("wrong accumulator")
        };
        assert_eq!(entries.len(), 5);
        let user = fx.engine.state.user_snapshot("testuser").unwrap();
        assert_eq!(user.user, "johndoe");
        assert_eq!(user.host, "example.com");
        assert_eq!(user.real_name, "John Doe");
        assert_eq!(user.server, "irc.x");
        assert!(user.is_operator);
        assert_eq!(user.idle_seconds, 42);
        assert_eq!(user.channels, "@#ops +#g #r");
    }

    #[tokio::test]
    async fn whois_numerics_for_other_targets_do_not_leak() {
        let fx = fixture();
        let (id, _rx) = fx.engine.pending.create(RequestKind::Whois, "wanted");
        fx.feed(&[
            ":s 311 bot bystander u h * :Other",
            ":s 318 bot bystander :End of WHOIS",
        ])
        .await;
        let data = fx.engine.pending.take(id).unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn list_burst_accumulates() {
        let fx = fixture();
        let (id, _rx) = fx.engine.pending.create(RequestKind::List, "");
        fx.feed(&[
            ":s 322 bot #a 3 :alpha",
            ":s 322 bot #b 12 :beta",
            ":s 323 bot :End of LIST",
        ])
        .await;
        let RequestData::List(entries) = fx.engine.pending.take(id).unwrap() else {
            panic!("wrong accumulator")
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].channel, "#b");
        assert_eq!(entries[1].users, 12);
        assert_eq!(entries[1].topic, "beta");
    }

    #[tokio::test]
    async fn list_burst_without_request_is_dropped() {
        let fx = fixture();
        fx.feed(&[":s 322 bot #a 3 :alpha", ":s 323 bot :End of LIST"])
            .await;
        assert!(fx.engine.pending.is_empty());
    }

    #[tokio::test]
    async fn server_info_numerics_populate_fields() {
        let fx = fixture();
        fx.feed(&[
            ":s 002 bot :Your host is irc.example.net, running version ircd-2.11",
            ":s 003 bot :This server was created Sat Mar 2 2024",
            ":s 004 bot irc.example.net ircd-2.11 aoOirw beiklmnopstv",
            ":s 005 bot CHANTYPES=# EXCEPTS NETWORK=ExampleNet :are supported by this server",
            ":s 251 bot :There are 17 users and 30 invisible on 4 servers",
            ":s 252 bot 5 :operator(s) online",
            ":s 253 bot 2 :unknown connection(s)",
            ":s 254 bot 11 :channels formed",
            ":s 255 bot :I have 42 clients and 1 servers",
            ":s 265 bot 40 99 :Current local users 40, max 99",
            ":s 266 bot 47 120 :Current global users 47, max 120",
        ])
        .await;
        let server = fx.engine.state.server_snapshot();
        assert_eq!(server.name, "irc.example.net");
        assert_eq!(server.version, "ircd-2.11");
        assert_eq!(server.created, "Sat Mar 2 2024");
        assert_eq!(server.user_modes, "aoOirw");
        assert_eq!(server.channel_modes, "beiklmnopstv");
        assert_eq!(server.isupport["CHANTYPES"], "#");
        assert_eq!(server.isupport["EXCEPTS"], "");
        assert_eq!(server.isupport["NETWORK"], "ExampleNet");
        assert_eq!(server.operators, 5);
        assert_eq!(server.unknown_connections, 2);
        assert_eq!(server.channels_formed, 11);
        assert_eq!(server.local_users, 40);
        assert_eq!(server.max_local_users, 99);
        assert_eq!(server.global_users, 47);
        assert_eq!(server.max_global_users, 120);
    }

    #[tokio::test]
    async fn motd_accumulates_and_restarts() {
        let fx = fixture();
        fx.feed(&[
            ":s 375 bot :- irc.example.net Message of the day -",
            ":s 372 bot :- line one",
            ":s 372 bot :line two",
            ":s 376 bot :End of MOTD",
        ])
        .await;
        assert_eq!(
            fx.engine.state.server_snapshot().motd,
            vec!["line one", "line two"]
        );
        fx.feed(&[":s 375 bot :- restart -"]).await;
        assert!(fx.engine.state.server_snapshot().motd.is_empty());
    }

    #[tokio::test]
    async fn topic_numerics_and_command() {
        let mut fx = fixture();
        fx.feed(&[
            ":bot!u@h JOIN :#a",
            ":s 332 bot #a :old topic",
            ":s 333 bot #a alice 1700000000",
        ])
        .await;
        let chan = fx.engine.state.channel_snapshot("#a").unwrap();
        assert_eq!(chan.topic, "old topic");
        assert_eq!(chan.topic_set_by, "alice");
        assert_eq!(chan.topic_set_time, 1700000000);

        fx.feed(&[":eve!u@h TOPIC #a :new topic"]).await;
        let chan = fx.engine.state.channel_snapshot("#a").unwrap();
        assert_eq!(chan.topic, "new topic");
        assert_eq!(chan.topic_set_by, "eve");
        assert!(fx.drain_events().iter().any(|e| e.event_type == "topic"));

        fx.feed(&[":s 331 bot #a :No topic is set"]).await;
        assert_eq!(fx.engine.state.channel_snapshot("#a").unwrap().topic, "");
    }

    #[tokio::test]
    async fn mask_lists_accumulate_with_trailing_only_form() {
        let fx = fixture();
        fx.feed(&[
            ":bot!u@h JOIN :#a",
            ":s 367 bot #a *!*@spam.example op 1700000001",
            ":s 367 bot #a :*!*@bare.example",
            ":s 368 bot #a :End of ban list",
            ":s 346 bot #a friend!*@* op 1700000002",
            ":s 348 bot #a good!*@* op 1700000003",
        ])
        .await;
        let chan = fx.engine.state.channel_snapshot("#a").unwrap();
        assert_eq!(chan.ban_list.len(), 2);
        assert_eq!(chan.ban_list[0].mask, "*!*@spam.example");
        assert_eq!(chan.ban_list[0].set_by, "op");
        assert_eq!(chan.ban_list[0].set_time, 1700000001);
        assert_eq!(chan.ban_list[1].mask, "*!*@bare.example");
        assert_eq!(chan.ban_list[1].reason, None);
        assert_eq!(chan.invite_list.len(), 1);
        assert_eq!(chan.except_list.len(), 1);
    }

    #[tokio::test]
    async fn channel_attribute_numerics() {
        let fx = fixture();
        fx.feed(&[
            ":bot!u@h JOIN :#a",
            ":s 324 bot #a +ntk sekrit",
            ":s 328 bot #a :https://example.org",
            ":s 329 bot #a 1600000000",
            ":s 325 bot #a uniqueguy",
        ])
        .await;
        let chan = fx.engine.state.channel_snapshot("#a").unwrap();
        assert_eq!(chan.modes, "+ntk");
        assert_eq!(chan.mode_params, vec!["sekrit"]);
        assert_eq!(chan.url, "https://example.org");
        assert_eq!(chan.created_time, 1600000000);
        assert_eq!(chan.special_info["unique_op"], "uniqueguy");
    }

    #[tokio::test]
    async fn numeric_325_user_form_goes_to_user_record() {
        let fx = fixture();
        fx.feed(&[":s 325 bot someone :is connecting via WEBIRC gateway"])
            .await;
        let user = fx.engine.state.user_snapshot("someone").unwrap();
        assert_eq!(user.special_info["325"], "is connecting via WEBIRC gateway");
    }

    #[tokio::test]
    async fn user_numerics_fill_records_lazily() {
        let fx = fixture();
        fx.feed(&[
            ":s 301 bot away_gal :gone fishing",
            ":s 335 bot robo :is a bot",
            ":s 671 bot sec :is using a secure connection",
            ":s 330 bot acct theaccount :is logged in as",
            ":s 338 bot real :is actually 10.1.2.3",
            ":s 344 bot geo DE :is connecting from Germany",
            ":s 276 bot certy :has client certificate fingerprint deadbeef",
            ":s 569 bot asny :AS64496 Example AS",
            ":s 307 bot reggy :is a registered nick",
        ])
        .await;
        let state = &fx.engine.state;
        assert!(state.user_snapshot("away_gal").unwrap().is_away);
        assert_eq!(
            state.user_snapshot("away_gal").unwrap().away_message,
            "gone fishing"
        );
        assert!(state.user_snapshot("robo").unwrap().is_bot);
        assert!(state.user_snapshot("sec").unwrap().is_secure);
        assert_eq!(state.user_snapshot("acct").unwrap().account, "theaccount");
        assert_eq!(state.user_snapshot("real").unwrap().actual_host, "10.1.2.3");
        assert_eq!(state.user_snapshot("geo").unwrap().country_code, "DE");
        assert_eq!(state.user_snapshot("geo").unwrap().country, "Germany");
        assert_eq!(
            state.user_snapshot("certy").unwrap().cert_fingerprint,
            "deadbeef"
        );
        assert_eq!(state.user_snapshot("asny").unwrap().asn, "AS64496");
        assert_eq!(
            state.user_snapshot("reggy").unwrap().special_info["307"],
            "is a registered nick"
        );
    }

    #[tokio::test]
    async fn error_numerics_land_in_the_ring() {
        let fx = fixture();
        fx.feed(&[
            ":s 401 bot ghost :No such nick",
            ":s 473 bot #private :Cannot join channel (+i)",
            ":s 999 bot :something nonstandard",
        ])
        .await;
        let errors = fx.engine.state.errors_snapshot();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].code, 401);
        assert_eq!(errors[0].target, "ghost");
        assert_eq!(errors[0].message, "No such nick");
        assert_eq!(errors[1].code, 473);

        let stats = fx.engine.state.stats_snapshot();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].entry_type, "unknown_numeric");
        assert_eq!(stats[0].fields["code"], "999");
    }

    #[tokio::test]
    async fn stats_numerics_land_in_the_stats_ring() {
        let fx = fixture();
        fx.feed(&[
            ":s 212 bot PRIVMSG 1234 :56789",
            ":s 242 bot :Server Up 3 days",
        ])
        .await;
        let stats = fx.engine.state.stats_snapshot();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].entry_type, "stats_212");
        assert_eq!(stats[0].fields["arg1"], "PRIVMSG");
        assert_eq!(stats[1].entry_type, "stats_242");
        assert_eq!(stats[1].fields["message"], "Server Up 3 days");
    }

    #[tokio::test]
    async fn nick_collision_appends_underscore_each_time() {
        let mut fx = fixture();
        fx.feed(&[":s 433 * bot :Nickname is already in use"]).await;
        assert_eq!(fx.engine.me(), "bot_");
        assert_eq!(fx.server.next_line().await.as_deref(), Some("NICK bot_"));
        fx.feed(&[":s 433 * bot_ :Nickname is already in use"]).await;
        assert_eq!(fx.engine.me(), "bot__");
        assert_eq!(fx.server.next_line().await.as_deref(), Some("NICK bot__"));
    }

    #[tokio::test]
    async fn sasl_handshake_flow() {
        let mut fx = fixture_with(|config| {
            config.sasl_user = Some("acct".to_owned());
            config.sasl_pass = Some("hunter2".to_owned());
        });
        fx.engine.registration.set_sasl_state(SaslState::Requested);
        fx.feed(&[":s CAP * ACK :message-tags sasl"]).await;
        assert_eq!(fx.engine.registration.sasl_state(), SaslState::InProgress);
        assert_eq!(
            fx.server.next_line().await.as_deref(),
            Some("AUTHENTICATE PLAIN")
        );

        fx.feed(&["AUTHENTICATE +"]).await;
        let line = fx.server.next_line().await.unwrap();
        assert_eq!(
            line,
            format!("AUTHENTICATE {}", sasl_plain_payload("acct", "hunter2"))
        );

        fx.feed(&[":s 903 bot :SASL authentication successful"]).await;
        assert_eq!(fx.engine.registration.sasl_state(), SaslState::Succeeded);
        assert_eq!(fx.server.next_line().await.as_deref(), Some("CAP END"));
    }

    #[tokio::test]
    async fn cap_ack_without_sasl_ends_negotiation() {
        let mut fx = fixture();
        fx.feed(&[":s CAP * ACK :message-tags"]).await;
        assert_eq!(fx.server.next_line().await.as_deref(), Some("CAP END"));
    }

    #[tokio::test]
    async fn cap_ack_missing_requested_sasl_aborts_immediately() {
        let mut fx = fixture_with(|config| {
            config.sasl_user = Some("acct".to_owned());
            config.sasl_pass = Some("hunter2".to_owned());
        });
        fx.engine.registration.set_sasl_state(SaslState::Requested);
        fx.feed(&[":s CAP * ACK :message-tags"]).await;
        // The outcome latch fires so registration continues right away.
        assert_eq!(fx.engine.registration.sasl_state(), SaslState::Aborted);
        assert_eq!(fx.server.next_line().await.as_deref(), Some("CAP END"));
    }

    #[tokio::test]
    async fn sasl_failure_still_ends_cap() {
        let mut fx = fixture_with(|config| {
            config.sasl_user = Some("acct".to_owned());
            config.sasl_pass = Some("bad".to_owned());
        });
        fx.engine.registration.set_sasl_state(SaslState::InProgress);
        fx.feed(&[":s 904 bot :SASL authentication failed"]).await;
        assert_eq!(fx.engine.registration.sasl_state(), SaslState::Failed);
        assert_eq!(fx.server.next_line().await.as_deref(), Some("CAP END"));
    }

    #[tokio::test]
    async fn account_numerics_set_and_clear_identity() {
        let fx = fixture();
        fx.feed(&[":s 900 bot bot!u@h theaccount :You are now logged in"])
            .await;
        assert_eq!(
            fx.engine.state.identity().account.as_deref(),
            Some("theaccount")
        );
        fx.feed(&[":s 901 bot bot!u@h :You are now logged out"]).await;
        assert_eq!(fx.engine.state.identity().account, None);
    }

    #[tokio::test]
    async fn garbage_lines_do_not_kill_the_engine() {
        let mut fx = fixture();
        fx.feed(&["", ":", "  ", ":s", "@tags-only"]).await;
        fx.feed(&["PING :still-alive"]).await;
        assert_eq!(
            fx.server.next_line().await.as_deref(),
            Some("PONG :still-alive")
        );
    }

    #[tokio::test]
    async fn ctcp_version_gets_a_notice_reply() {
        let mut fx = fixture();
        fx.feed(&[":u!u@h PRIVMSG bot :\u{1}VERSION\u{1}"]).await;
        let line = fx.server.next_line().await.unwrap();
        assert!(line.starts_with("NOTICE u :\u{1}VERSION ircship"));
    }
}
