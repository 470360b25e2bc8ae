//! Correlation of in-flight LIST/WHOIS calls with the multi-line numeric
//! bursts that answer them.
//!
//! Callers create a request, emit the command on the wire, and block on a
//! one-shot completion signal with a bounded wait. The protocol engine
//! routes 322/323 and 311/312/313/317/318/319 into the matching accumulator.
//! A per-request expiry task guarantees every request completes within
//! [`REQUEST_LIFETIME`] no matter what the server does.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

/// Hard lifetime after which a request is completed and garbage-collected.
pub const REQUEST_LIFETIME: Duration = Duration::from_secs(30);

/// How long a caller blocks before settling for a partial accumulator.
pub const CALLER_WAIT: Duration = Duration::from_secs(10);

/// The two request families the table correlates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    List,
    Whois,
}

/// One channel from a LIST reply (numeric 322).
#[derive(Clone, Debug, Serialize)]
pub struct ListEntry {
    pub channel: String,
    pub users: u64,
    pub topic: String,
}

/// One typed sub-record of a WHOIS burst.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WhoisEntry {
    /// 311: user/host/real name.
    User {
        user: String,
        host: String,
        real_name: String,
    },
    /// 312: server and its info line.
    Server { server: String, server_info: String },
    /// 313: operator privileges text.
    Operator { privileges: String },
    /// 317: idle seconds and the descriptive trailing.
    Idle {
        idle_seconds: String,
        idle_info: String,
    },
    /// 319: channel list, prefixes included.
    Channels { channels: String },
}

/// A request's accumulator.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum RequestData {
    List(Vec<ListEntry>),
    Whois(Vec<WhoisEntry>),
}

impl RequestData {
    pub fn len(&self) -> usize {
        match self {
            RequestData::List(entries) => entries.len(),
            RequestData::Whois(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PendingRequest {
    id: u64,
    kind: RequestKind,
    target: String,
    data: RequestData,
    complete: bool,
    waker: Option<oneshot::Sender<()>>,
}

impl PendingRequest {
    fn finish(&mut self) {
        self.complete = true;
        if let Some(waker) = self.waker.take() {
            let _ = waker.send(());
        }
    }
}

/// The table itself. Requests are kept in creation order so bursts route to
/// the oldest non-complete match.
#[derive(Default)]
pub struct PendingTable {
    requests: Mutex<Vec<PendingRequest>>,
    next_id: AtomicU64,
}

impl PendingTable {
    pub fn new() -> PendingTable {
        PendingTable::default()
    }

    /// Registers a new request and returns its id plus the completion signal.
    pub fn create(&self, kind: RequestKind, target: &str) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let data = match kind {
            RequestKind::List => RequestData::List(Vec::new()),
            RequestKind::Whois => RequestData::Whois(Vec::new()),
        };
        self.requests.lock().push(PendingRequest {
            id,
            kind,
            target: target.to_owned(),
            data,
            complete: false,
            waker: Some(tx),
        });
        (id, rx)
    }

    /// Appends a 322 entry to the oldest non-complete LIST request. Bursts
    /// with no matching request are dropped.
    pub fn push_list_entry(&self, entry: ListEntry) -> bool {
        let mut requests = self.requests.lock();
        match requests
            .iter_mut()
            .find(|r| r.kind == RequestKind::List && !r.complete)
        {
            Some(request) => {
                if let RequestData::List(entries) = &mut request.data {
                    entries.push(entry);
                }
                true
            }
            None => false,
        }
    }

    /// Completes the oldest non-complete LIST request (numeric 323).
    pub fn complete_list(&self) -> bool {
        let mut requests = self.requests.lock();
        match requests
            .iter_mut()
            .find(|r| r.kind == RequestKind::List && !r.complete)
        {
            Some(request) => {
                request.finish();
                true
            }
            None => false,
        }
    }

    /// Appends a WHOIS sub-record to the non-complete request whose target
    /// matches `nick` case-insensitively.
    pub fn push_whois_entry(&self, nick: &str, entry: WhoisEntry) -> bool {
        let mut requests = self.requests.lock();
        match requests.iter_mut().find(|r| {
            r.kind == RequestKind::Whois && !r.complete && r.target.eq_ignore_ascii_case(nick)
        }) {
            Some(request) => {
                if let RequestData::Whois(entries) = &mut request.data {
                    entries.push(entry);
                }
                true
            }
            None => false,
        }
    }

    /// Completes the matching WHOIS request (numeric 318). Unmatched 318s
    /// are dropped.
    pub fn complete_whois(&self, nick: &str) -> bool {
        let mut requests = self.requests.lock();
        match requests.iter_mut().find(|r| {
            r.kind == RequestKind::Whois && !r.complete && r.target.eq_ignore_ascii_case(nick)
        }) {
            Some(request) => {
                request.finish();
                true
            }
            None => false,
        }
    }

    /// True if any request (complete or not) still targets `nick` via WHOIS.
    /// Used to keep user records alive while a caller may still read them.
    pub fn has_whois_for(&self, nick: &str) -> bool {
        self.requests
            .lock()
            .iter()
            .any(|r| r.kind == RequestKind::Whois && r.target.eq_ignore_ascii_case(nick))
    }

    /// Removes a request, returning its (possibly partial) accumulator.
    pub fn take(&self, id: u64) -> Option<RequestData> {
        let mut requests = self.requests.lock();
        let idx = requests.iter().position(|r| r.id == id)?;
        Some(requests.remove(idx).data)
    }

    /// Deadline expiry: completes (waking any waiter) and removes the
    /// request if the caller has not already taken it.
    pub fn expire(&self, id: u64) {
        let mut requests = self.requests.lock();
        if let Some(idx) = requests.iter().position(|r| r.id == id) {
            requests[idx].finish();
            requests.remove(idx);
        }
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

/// Projects a WHOIS accumulator into the flat structured mapping returned by
/// the control surface. Fields the burst never supplied are absent.
pub fn whois_structured(nick: &str, entries: &[WhoisEntry]) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("nick".to_owned(), Value::String(nick.to_owned()));
    for entry in entries {
        match entry {
            WhoisEntry::User {
                user,
                host,
                real_name,
            } => {
                out.insert("user".to_owned(), Value::String(user.clone()));
                out.insert("host".to_owned(), Value::String(host.clone()));
                out.insert("real_name".to_owned(), Value::String(real_name.clone()));
            }
            WhoisEntry::Server {
                server,
                server_info,
            } => {
                out.insert("server".to_owned(), Value::String(server.clone()));
                out.insert("server_info".to_owned(), Value::String(server_info.clone()));
            }
            WhoisEntry::Operator { privileges } => {
                out.insert("operator".to_owned(), Value::Bool(true));
                out.insert("privileges".to_owned(), Value::String(privileges.clone()));
            }
            WhoisEntry::Idle {
                idle_seconds,
                idle_info,
            } => {
                out.insert("idle_seconds".to_owned(), Value::String(idle_seconds.clone()));
                out.insert("idle_info".to_owned(), Value::String(idle_info.clone()));
            }
            WhoisEntry::Channels { channels } => {
                out.insert("channels".to_owned(), Value::String(channels.clone()));
            }
        }
    }
    out.insert(
        "raw_data".to_owned(),
        serde_json::to_value(entries).unwrap_or(Value::Null),
    );
    out
}
