//! Webhook fan-out: reformats selected IRC events into JSON and posts them
//! to every configured endpoint whose filters accept them.
//!
//! Posts run in their own spawned tasks so a slow endpoint can never stall
//! the read loop; failures are logged per endpoint and never retried.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::config::Config;

/// Deadline for each webhook post.
pub const POST_TIMEOUT: Duration = Duration::from_secs(10);

/// The event families the daemon emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Join,
    Part,
    Kick,
    Quit,
    Mode,
    Topic,
    Privmsg,
    Notice,
    Mention,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Join => "join",
            EventType::Part => "part",
            EventType::Kick => "kick",
            EventType::Quit => "quit",
            EventType::Mode => "mode",
            EventType::Topic => "topic",
            EventType::Privmsg => "privmsg",
            EventType::Notice => "notice",
            EventType::Mention => "mention",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One domain event, shaped for the webhook JSON body.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: String,
    pub sender: String,
    pub target: String,
    pub message: String,
    pub chat_input: String,
    pub bot_nick: String,
    pub session_id: String,
    pub timestamp: i64,
    pub message_tags: HashMap<String, String>,
}

impl Event {
    /// Builds an event stamped with the current time. `chat_input` defaults
    /// to the message body; callers with a distinct auxiliary field (kick
    /// reasons) override it afterwards.
    pub fn new(
        event_type: EventType,
        sender: &str,
        target: &str,
        message: &str,
        bot_nick: &str,
    ) -> Event {
        Event {
            event_type: event_type.as_str().to_owned(),
            sender: sender.to_owned(),
            target: target.to_owned(),
            message: message.to_owned(),
            chat_input: message.to_owned(),
            bot_nick: bot_nick.to_owned(),
            session_id: "IRC".to_owned(),
            timestamp: Utc::now().timestamp(),
            message_tags: HashMap::new(),
        }
    }

    pub fn with_chat_input(mut self, chat_input: &str) -> Event {
        self.chat_input = chat_input.to_owned();
        self
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Event {
        self.message_tags = tags;
        self
    }
}

/// A configured endpoint with its resolved filters. Filter sets are stored
/// lowercased; an empty set means no filter.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub token: Option<String>,
    pub events: HashSet<String>,
    pub channels: HashSet<String>,
    pub users: HashSet<String>,
}

impl Endpoint {
    /// Event type must be wanted, and both the channel and user filters
    /// must be empty or contain the event's target/sender.
    pub fn wants(&self, event: &Event) -> bool {
        self.events.contains(&event.event_type)
            && (self.channels.is_empty()
                || self.channels.contains(&event.target.to_ascii_lowercase()))
            && (self.users.is_empty() || self.users.contains(&event.sender.to_ascii_lowercase()))
    }
}

/// Fans events out to the configured endpoints.
pub struct Dispatcher {
    endpoints: Vec<Endpoint>,
    http: reqwest::Client,
}

impl Dispatcher {
    /// Resolves endpoints from the trigger config, or synthesizes the
    /// `legacy` mention-only endpoint from a bare webhook URL.
    pub fn from_config(config: &Config) -> Dispatcher {
        let mut endpoints = Vec::new();
        match &config.triggers {
            Some(triggers) => {
                for (name, trigger) in triggers {
                    endpoints.push(Endpoint {
                        name: name.clone(),
                        url: trigger.url.clone(),
                        token: trigger.token.clone(),
                        events: trigger.events.clone(),
                        channels: lowered(trigger.channels.as_ref()),
                        users: lowered(trigger.users.as_ref()),
                    });
                }
            }
            None => {
                if let Some(url) = &config.webhook_url {
                    endpoints.push(Endpoint {
                        name: "legacy".to_owned(),
                        url: url.clone(),
                        token: None,
                        events: HashSet::from(["mention".to_owned()]),
                        channels: HashSet::new(),
                        users: HashSet::new(),
                    });
                }
            }
        }
        Dispatcher {
            endpoints,
            http: reqwest::Client::builder()
                .timeout(POST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Posts the event to every endpoint whose filters accept it, each in
    /// its own task.
    pub fn dispatch(&self, event: Event) {
        for endpoint in self.endpoints.iter().filter(|e| e.wants(&event)) {
            let endpoint = endpoint.clone();
            let event = event.clone();
            let http = self.http.clone();
            tokio::spawn(async move {
                post_event(http, endpoint, event).await;
            });
        }
    }
}

async fn post_event(http: reqwest::Client, endpoint: Endpoint, event: Event) {
    let mut request = http.post(&endpoint.url).json(&event);
    if let Some(token) = &endpoint.token {
        request = request.bearer_auth(token);
    }
    match request.send().await {
        Ok(response) if response.status().is_success() => {
            log::debug!(
                "webhook {}: delivered {} for {}",
                endpoint.name,
                event.event_type,
                event.target
            );
        }
        Ok(response) => {
            log::warn!(
                "webhook {}: {} returned {}",
                endpoint.name,
                endpoint.url,
                response.status()
            );
        }
        Err(err) => {
            log::warn!("webhook {}: post failed: {}", endpoint.name, err);
        }
    }
}

fn lowered(set: Option<&HashSet<String>>) -> HashSet<String> {
    set.map(|s| s.iter().map(|v| v.to_ascii_lowercase()).collect())
        .unwrap_or_default()
}
