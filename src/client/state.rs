//! Concurrency-safe containers for everything the daemon tracks about the
//! network: server details, channel membership, per-user WHOIS data, and
//! bounded rings of stats and error numerics.
//!
//! Each category sits behind its own `parking_lot::RwLock`. To stay
//! deadlock-free, nested acquisition must follow the declaration order:
//! identity, then server, channels, users, stats, errors. Every read
//! returns a clone; callers never hold references into the store.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;

const STATS_CAPACITY: usize = 1000;
const ERRORS_CAPACITY: usize = 100;

/// Who the daemon currently is on the network.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ClientIdentity {
    /// Current nick. Mutated only by accepted NICK reflection, 433
    /// collision recovery, or an explicit nick change request.
    pub nick: String,
    /// Username sent at registration.
    pub user: String,
    /// Real name sent at registration.
    pub real_name: String,
    /// Services account, set by 900 and cleared by 901.
    pub account: Option<String>,
}

/// Administrative contact block from numerics 256–259.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AdminInfo {
    pub server: String,
    pub location1: String,
    pub location2: String,
    pub email: String,
}

/// Everything learned about the server since the last registration.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub user_modes: String,
    pub channel_modes: String,
    pub created: String,
    /// ISUPPORT tokens from 005; valueless tokens map to the empty string.
    pub isupport: HashMap<String, String>,
    pub admin: AdminInfo,
    /// MOTD lines in order, leading `"- "` stripped.
    pub motd: Vec<String>,
    pub local_users: u64,
    pub global_users: u64,
    pub max_local_users: u64,
    pub max_global_users: u64,
    pub operators: u64,
    pub unknown_connections: u64,
    pub channels_formed: u64,
}

/// A ban/invite/except list entry.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MaskEntry {
    pub mask: String,
    pub set_by: String,
    pub set_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Tracked state for one joined channel.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ChannelState {
    /// Nick (as last seen on the wire) to mode-letter string, e.g. `"ov"`.
    pub users: HashMap<String, String>,
    pub topic: String,
    pub topic_set_by: String,
    pub topic_set_time: u64,
    pub created_time: u64,
    pub modes: String,
    pub mode_params: Vec<String>,
    pub ban_list: Vec<MaskEntry>,
    pub invite_list: Vec<MaskEntry>,
    pub except_list: Vec<MaskEntry>,
    pub url: String,
    pub special_info: HashMap<String, String>,
}

impl ChannelState {
    /// Inserts or replaces a user, enforcing case-insensitive uniqueness.
    pub fn set_user(&mut self, nick: &str, modes: &str) {
        self.users
            .retain(|existing, _| !existing.eq_ignore_ascii_case(nick));
        self.users.insert(nick.to_owned(), modes.to_owned());
    }

    /// Removes a user by case-insensitive nick. Returns whether one was there.
    pub fn remove_user(&mut self, nick: &str) -> bool {
        let before = self.users.len();
        self.users
            .retain(|existing, _| !existing.eq_ignore_ascii_case(nick));
        self.users.len() != before
    }

    /// Case-insensitive membership test.
    pub fn has_user(&self, nick: &str) -> bool {
        self.users.keys().any(|n| n.eq_ignore_ascii_case(nick))
    }

    /// Renames a user preserving their mode string. Returns whether the old
    /// nick was present.
    pub fn rename_user(&mut self, old: &str, new: &str) -> bool {
        let key = match self.users.keys().find(|n| n.eq_ignore_ascii_case(old)) {
            Some(key) => key.clone(),
            None => return false,
        };
        let modes = self.users.remove(&key).unwrap_or_default();
        self.set_user(new, &modes);
        true
    }

    /// Grants a mode letter to a user already in the channel. Adding a letter
    /// twice is a no-op; users not present are ignored.
    pub fn add_user_mode(&mut self, nick: &str, letter: char) {
        for (existing, modes) in self.users.iter_mut() {
            if existing.eq_ignore_ascii_case(nick) && !modes.contains(letter) {
                modes.push(letter);
            }
        }
    }

    /// Removes a mode letter from a user. Removing an absent letter is a no-op.
    pub fn remove_user_mode(&mut self, nick: &str, letter: char) {
        for (existing, modes) in self.users.iter_mut() {
            if existing.eq_ignore_ascii_case(nick) {
                modes.retain(|c| c != letter);
            }
        }
    }
}

/// Per-user info accumulated from WHOIS and related numerics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct UserInfo {
    pub nick: String,
    pub user: String,
    pub host: String,
    pub real_name: String,
    pub server: String,
    pub server_info: String,
    pub account: String,
    pub is_operator: bool,
    pub is_away: bool,
    pub is_bot: bool,
    pub is_secure: bool,
    pub away_message: String,
    pub idle_seconds: u64,
    pub signon_time: u64,
    pub modes: String,
    /// Channel list as sent by 319, prefixes included.
    pub channels: String,
    pub cert_fingerprint: String,
    pub actual_host: String,
    pub country_code: String,
    pub country: String,
    pub asn: String,
    pub webirc_gateway: String,
    /// Free-form info from the odd WHOIS numerics (307/308/309/310/320/…).
    pub special_info: HashMap<String, String>,
}

/// One stats-ring entry: an informational stats numeric or an unknown numeric.
#[derive(Clone, Debug, Serialize)]
pub struct StatEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub fields: HashMap<String, String>,
    pub time: i64,
}

/// One errors-ring entry for a server error numeric.
#[derive(Clone, Debug, Serialize)]
pub struct IrcError {
    pub code: u16,
    pub target: String,
    pub message: String,
    pub time: i64,
}

/// The store itself. See the module docs for the locking discipline.
#[derive(Default)]
pub struct StateStore {
    identity: RwLock<ClientIdentity>,
    server: RwLock<ServerInfo>,
    channels: RwLock<HashMap<String, ChannelState>>,
    users: RwLock<HashMap<String, UserInfo>>,
    stats: RwLock<VecDeque<StatEntry>>,
    errors: RwLock<VecDeque<IrcError>>,
}

impl StateStore {
    pub fn new() -> StateStore {
        StateStore::default()
    }

    /// Clears everything rebuilt during a registration: server info,
    /// channel membership, and user records. The stats and error rings are
    /// diagnostics and survive reconnects.
    pub fn reset_connection_state(&self) {
        *self.server.write() = ServerInfo::default();
        self.channels.write().clear();
        self.users.write().clear();
    }

    // --- identity ---------------------------------------------------------

    pub fn identity(&self) -> ClientIdentity {
        self.identity.read().clone()
    }

    pub fn current_nick(&self) -> String {
        self.identity.read().nick.clone()
    }

    pub fn with_identity_mut<R>(&self, f: impl FnOnce(&mut ClientIdentity) -> R) -> R {
        f(&mut self.identity.write())
    }

    // --- server -----------------------------------------------------------

    pub fn with_server_mut<R>(&self, f: impl FnOnce(&mut ServerInfo) -> R) -> R {
        f(&mut self.server.write())
    }

    pub fn server_snapshot(&self) -> ServerInfo {
        self.server.read().clone()
    }

    // --- channels ---------------------------------------------------------

    /// Creates (or resets) tracked state for a channel we just joined.
    pub fn create_channel(&self, name: &str) {
        self.channels
            .write()
            .insert(name.to_ascii_lowercase(), ChannelState::default());
    }

    pub fn remove_channel(&self, name: &str) -> bool {
        self.channels
            .write()
            .remove(&name.to_ascii_lowercase())
            .is_some()
    }

    /// Runs `f` against a channel's state, if the channel is tracked.
    pub fn with_channel_mut<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut ChannelState) -> R,
    ) -> Option<R> {
        self.channels
            .write()
            .get_mut(&name.to_ascii_lowercase())
            .map(f)
    }

    pub fn channel_snapshot(&self, name: &str) -> Option<ChannelState> {
        self.channels
            .read()
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    pub fn channels_snapshot(&self) -> HashMap<String, ChannelState> {
        self.channels.read().clone()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    /// Removes a nick from every channel. Returns the channels it was in.
    pub fn remove_user_from_all_channels(&self, nick: &str) -> Vec<String> {
        let mut affected = Vec::new();
        for (name, chan) in self.channels.write().iter_mut() {
            if chan.remove_user(nick) {
                affected.push(name.clone());
            }
        }
        affected
    }

    /// Renames a nick in every channel, preserving mode strings.
    pub fn rename_user_in_channels(&self, old: &str, new: &str) {
        for chan in self.channels.write().values_mut() {
            chan.rename_user(old, new);
        }
    }

    /// True if the nick is present in at least one tracked channel.
    pub fn user_in_any_channel(&self, nick: &str) -> bool {
        self.channels.read().values().any(|c| c.has_user(nick))
    }

    // --- users ------------------------------------------------------------

    /// Runs `f` against a user record, creating it lazily on first reference.
    pub fn with_user_mut<R>(&self, nick: &str, f: impl FnOnce(&mut UserInfo) -> R) -> R {
        let key = nick.to_ascii_lowercase();
        let mut users = self.users.write();
        let entry = users.entry(key).or_insert_with(|| UserInfo {
            nick: nick.to_owned(),
            ..UserInfo::default()
        });
        f(entry)
    }

    pub fn user_snapshot(&self, nick: &str) -> Option<UserInfo> {
        self.users.read().get(&nick.to_ascii_lowercase()).cloned()
    }

    pub fn users_snapshot(&self) -> HashMap<String, UserInfo> {
        self.users.read().clone()
    }

    /// Renames a user record, keeping accumulated info.
    pub fn rename_user(&self, old: &str, new: &str) {
        let mut users = self.users.write();
        if let Some(mut info) = users.remove(&old.to_ascii_lowercase()) {
            info.nick = new.to_owned();
            users.insert(new.to_ascii_lowercase(), info);
        }
    }

    /// Drops a user record once the nick is gone from every channel and no
    /// WHOIS is still in flight for it.
    pub fn drop_user_if_orphaned(&self, nick: &str, has_pending_whois: bool) {
        if has_pending_whois || self.user_in_any_channel(nick) {
            return;
        }
        self.users.write().remove(&nick.to_ascii_lowercase());
    }

    // --- rings ------------------------------------------------------------

    pub fn push_stat(&self, entry: StatEntry) {
        let mut stats = self.stats.write();
        if stats.len() == STATS_CAPACITY {
            stats.pop_front();
        }
        stats.push_back(entry);
    }

    pub fn push_error(&self, error: IrcError) {
        let mut errors = self.errors.write();
        if errors.len() == ERRORS_CAPACITY {
            errors.pop_front();
        }
        errors.push_back(error);
    }

    pub fn stats_snapshot(&self) -> Vec<StatEntry> {
        self.stats.read().iter().cloned().collect()
    }

    pub fn errors_snapshot(&self) -> Vec<IrcError> {
        self.errors.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_users_are_case_insensitive_and_unique() {
        let mut chan = ChannelState::default();
        chan.set_user("Alice", "o");
        chan.set_user("ALICE", "v");
        assert_eq!(chan.users.len(), 1);
        assert!(chan.has_user("alice"));
        assert_eq!(chan.users["ALICE"], "v");
    }

    #[test]
    fn user_modes_dedupe() {
        let mut chan = ChannelState::default();
        chan.set_user("bob", "");
        chan.add_user_mode("bob", 'o');
        chan.add_user_mode("BOB", 'o');
        chan.add_user_mode("bob", 'v');
        assert_eq!(chan.users["bob"], "ov");
        chan.remove_user_mode("bob", 'o');
        chan.remove_user_mode("bob", 'o');
        assert_eq!(chan.users["bob"], "v");
        // Mode changes for absent users change nothing.
        chan.add_user_mode("carol", 'o');
        assert!(!chan.has_user("carol"));
    }

    #[test]
    fn mode_apply_then_undo_is_identity() {
        let mut chan = ChannelState::default();
        chan.set_user("dave", "h");
        chan.add_user_mode("dave", 'o');
        chan.add_user_mode("dave", 'v');
        chan.remove_user_mode("dave", 'o');
        chan.remove_user_mode("dave", 'v');
        assert_eq!(chan.users["dave"], "h");
    }

    #[test]
    fn rename_preserves_modes() {
        let store = StateStore::new();
        store.create_channel("#A");
        store
            .with_channel_mut("#a", |c| c.set_user("old", "ov"))
            .unwrap();
        store.rename_user_in_channels("OLD", "new");
        let chan = store.channel_snapshot("#A").unwrap();
        assert_eq!(chan.users["new"], "ov");
        assert!(!chan.has_user("old"));
    }

    #[test]
    fn user_store_folds_case() {
        let store = StateStore::new();
        store.with_user_mut("Carol", |u| u.host = "h".into());
        assert_eq!(store.user_snapshot("CAROL").unwrap().host, "h");
        assert_eq!(store.user_snapshot("carol").unwrap().nick, "Carol");
    }

    #[test]
    fn orphan_user_dropped_only_when_gone_everywhere() {
        let store = StateStore::new();
        store.create_channel("#a");
        store.with_channel_mut("#a", |c| c.set_user("eve", "")).unwrap();
        store.with_user_mut("eve", |_| {});

        store.drop_user_if_orphaned("eve", false);
        assert!(store.user_snapshot("eve").is_some());

        store.remove_user_from_all_channels("eve");
        store.with_user_mut("eve", |_| {});
        store.drop_user_if_orphaned("eve", true);
        assert!(store.user_snapshot("eve").is_some());
        store.drop_user_if_orphaned("eve", false);
        assert!(store.user_snapshot("eve").is_none());
    }

    #[test]
    fn rings_evict_oldest() {
        let store = StateStore::new();
        for i in 0..(ERRORS_CAPACITY + 5) {
            store.push_error(IrcError {
                code: 400,
                target: String::new(),
                message: format!("e{}", i),
                time: 0,
            });
        }
        let errors = store.errors_snapshot();
        assert_eq!(errors.len(), ERRORS_CAPACITY);
        assert_eq!(errors[0].message, "e5");

        for i in 0..(STATS_CAPACITY + 1) {
            store.push_stat(StatEntry {
                entry_type: "stats_211".into(),
                fields: HashMap::from([("i".to_owned(), i.to_string())]),
                time: 0,
            });
        }
        let stats = store.stats_snapshot();
        assert_eq!(stats.len(), STATS_CAPACITY);
        assert_eq!(stats[0].fields["i"], "1");
    }

    #[test]
    fn reset_clears_rebuildable_state_only() {
        let store = StateStore::new();
        store.create_channel("#a");
        store.with_user_mut("x", |_| {});
        store.with_server_mut(|s| s.name = "srv".into());
        store.push_error(IrcError {
            code: 401,
            target: "x".into(),
            message: "m".into(),
            time: 0,
        });
        store.reset_connection_state();
        assert!(store.channels_snapshot().is_empty());
        assert!(store.users_snapshot().is_empty());
        assert!(store.server_snapshot().name.is_empty());
        assert_eq!(store.errors_snapshot().len(), 1);
    }
}
