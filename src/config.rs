//! Daemon configuration.
//!
//! Configuration is loaded from a TOML file, with every deployment-relevant
//! field overridable through `IRCSHIP_*` environment variables so the daemon
//! can run from a bare container environment without a file at all.

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level daemon configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Server address as `host:port`.
    #[serde(default)]
    pub server: String,
    /// Whether to connect over TLS. On by default.
    #[serde(default = "default_true")]
    pub use_tls: bool,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
    /// Server password, sent as `PASS` before registration.
    #[serde(default)]
    pub server_password: Option<String>,

    /// Nickname to register with.
    #[serde(default)]
    pub nick: String,
    /// Username for the `USER` command. Defaults to the nick.
    #[serde(default)]
    pub user: Option<String>,
    /// Real name for the `USER` command. Defaults to the nick.
    #[serde(default)]
    pub real_name: Option<String>,

    /// SASL PLAIN account name. SASL is attempted iff both user and pass are set.
    #[serde(default)]
    pub sasl_user: Option<String>,
    /// SASL PLAIN password.
    #[serde(default)]
    pub sasl_pass: Option<String>,

    /// Channels to join after registration.
    #[serde(default)]
    pub autojoin: Vec<String>,

    /// Webhook endpoints keyed by name.
    #[serde(default)]
    pub triggers: Option<HashMap<String, TriggerEndpoint>>,
    /// Legacy single-webhook URL; synthesized into a `legacy` endpoint
    /// listening for mentions when `triggers` is absent.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Characters that suppress a mention when adjacent to the matched nick.
    #[serde(default = "default_ignore_chars")]
    pub mention_ignore_chars: Vec<char>,

    /// Flood-protection settings for outgoing PRIVMSGs.
    #[serde(default)]
    pub flood: FloodConfig,

    /// HTTP control-plane settings.
    #[serde(default)]
    pub control: ControlConfig,
}

impl Default for Config {
    /// Matches the serde field defaults, so an empty TOML document and
    /// `Config::default()` agree.
    fn default() -> Config {
        Config {
            server: String::new(),
            use_tls: default_true(),
            tls_insecure_skip_verify: false,
            server_password: None,
            nick: String::new(),
            user: None,
            real_name: None,
            sasl_user: None,
            sasl_pass: None,
            autojoin: Vec::new(),
            triggers: None,
            webhook_url: None,
            mention_ignore_chars: default_ignore_chars(),
            flood: FloodConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

/// A single webhook endpoint with its filters.
#[derive(Clone, Debug, Deserialize)]
pub struct TriggerEndpoint {
    /// Endpoint URL to POST events to.
    pub url: String,
    /// Optional bearer token sent with each post.
    #[serde(default)]
    pub token: Option<String>,
    /// Event types this endpoint wants.
    #[serde(default)]
    pub events: HashSet<String>,
    /// Channel filter; empty or absent means no filter.
    #[serde(default)]
    pub channels: Option<HashSet<String>>,
    /// Sender-nick filter; empty or absent means no filter.
    #[serde(default)]
    pub users: Option<HashSet<String>>,
}

/// Flood-protection policy for outgoing PRIVMSGs.
#[derive(Clone, Debug, Deserialize)]
pub struct FloodConfig {
    /// Channels the policy applies to (case-insensitive).
    #[serde(default)]
    pub protected_channels: Vec<String>,
    /// Post-split line count above which the paste service takes over.
    #[serde(default = "default_flood_threshold")]
    pub line_threshold: usize,
    /// Shell command template producing a paste URL on stdout. The
    /// `{{filename}}` placeholder is replaced by a temp file holding the
    /// full message text.
    #[serde(default)]
    pub paste_command: Option<String>,
}

impl Default for FloodConfig {
    fn default() -> FloodConfig {
        FloodConfig {
            protected_channels: Vec::new(),
            line_threshold: default_flood_threshold(),
            paste_command: None,
        }
    }
}

/// HTTP control-plane listener settings.
#[derive(Clone, Debug, Deserialize)]
pub struct ControlConfig {
    /// Listen address, e.g. `127.0.0.1:8070`.
    #[serde(default = "default_control_addr")]
    pub addr: String,
    /// Serve the control plane over TLS.
    #[serde(default)]
    pub use_tls: bool,
    /// PEM certificate path, required when `use_tls` is set.
    #[serde(default)]
    pub cert_path: Option<String>,
    /// PEM private-key path, required when `use_tls` is set.
    #[serde(default)]
    pub key_path: Option<String>,
    /// Bearer token for every non-health route. With no token configured,
    /// all non-health requests are rejected.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ControlConfig {
    fn default() -> ControlConfig {
        ControlConfig {
            addr: default_control_addr(),
            use_tls: false,
            cert_path: None,
            key_path: None,
            token: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_flood_threshold() -> usize {
    3
}

fn default_ignore_chars() -> Vec<char> {
    vec!['/']
}

fn default_control_addr() -> String {
    "127.0.0.1:8070".to_owned()
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let data = fs::read_to_string(path.as_ref())?;
        toml::from_str(&data).map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))
    }

    /// Applies `IRCSHIP_*` environment overrides on top of the current values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var("IRCSHIP_SERVER") {
            self.server = v;
        }
        if let Ok(v) = env::var("IRCSHIP_USE_TLS") {
            self.use_tls = parse_bool(&v)?;
        }
        if let Ok(v) = env::var("IRCSHIP_TLS_INSECURE_SKIP_VERIFY") {
            self.tls_insecure_skip_verify = parse_bool(&v)?;
        }
        if let Ok(v) = env::var("IRCSHIP_SERVER_PASSWORD") {
            self.server_password = Some(v);
        }
        if let Ok(v) = env::var("IRCSHIP_NICK") {
            self.nick = v;
        }
        if let Ok(v) = env::var("IRCSHIP_USER") {
            self.user = Some(v);
        }
        if let Ok(v) = env::var("IRCSHIP_REAL_NAME") {
            self.real_name = Some(v);
        }
        if let Ok(v) = env::var("IRCSHIP_SASL_USER") {
            self.sasl_user = Some(v);
        }
        if let Ok(v) = env::var("IRCSHIP_SASL_PASS") {
            self.sasl_pass = Some(v);
        }
        if let Ok(v) = env::var("IRCSHIP_AUTOJOIN") {
            self.autojoin = split_csv(&v);
        }
        if let Ok(v) = env::var("IRCSHIP_TRIGGERS") {
            let parsed: HashMap<String, TriggerEndpoint> = serde_json::from_str(&v)
                .map_err(|e| Error::Config(format!("IRCSHIP_TRIGGERS: {}", e)))?;
            self.triggers = Some(parsed);
        }
        if let Ok(v) = env::var("IRCSHIP_WEBHOOK_URL") {
            self.webhook_url = Some(v);
        }
        if let Ok(v) = env::var("IRCSHIP_PROTECTED_CHANNELS") {
            self.flood.protected_channels = split_csv(&v);
        }
        if let Ok(v) = env::var("IRCSHIP_FLOOD_THRESHOLD") {
            self.flood.line_threshold = v
                .parse()
                .map_err(|_| Error::Config(format!("IRCSHIP_FLOOD_THRESHOLD: not a number: {}", v)))?;
        }
        if let Ok(v) = env::var("IRCSHIP_PASTE_COMMAND") {
            self.flood.paste_command = Some(v);
        }
        if let Ok(v) = env::var("IRCSHIP_CONTROL_ADDR") {
            self.control.addr = v;
        }
        if let Ok(v) = env::var("IRCSHIP_CONTROL_TLS") {
            self.control.use_tls = parse_bool(&v)?;
        }
        if let Ok(v) = env::var("IRCSHIP_CONTROL_CERT") {
            self.control.cert_path = Some(v);
        }
        if let Ok(v) = env::var("IRCSHIP_CONTROL_KEY") {
            self.control.key_path = Some(v);
        }
        if let Ok(v) = env::var("IRCSHIP_CONTROL_TOKEN") {
            self.control.token = Some(v);
        }
        Ok(())
    }

    /// Checks startup invariants. Violations are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::Config("server address is required".into()));
        }
        if self.nick.is_empty() {
            return Err(Error::Config("nick is required".into()));
        }
        if self.control.use_tls
            && (self.control.cert_path.is_none() || self.control.key_path.is_none())
        {
            return Err(Error::Config(
                "control-plane TLS requires both cert_path and key_path".into(),
            ));
        }
        if let Some(triggers) = &self.triggers {
            for (name, endpoint) in triggers {
                if endpoint.url.is_empty() {
                    return Err(Error::Config(format!("trigger {}: url is required", name)));
                }
            }
        }
        Ok(())
    }

    /// The username sent with `USER`, defaulting to the nick.
    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or(&self.nick)
    }

    /// The real name sent with `USER`, defaulting to the nick.
    pub fn real_name(&self) -> &str {
        self.real_name.as_deref().unwrap_or(&self.nick)
    }

    /// SASL credentials, present iff both halves are configured.
    pub fn sasl_credentials(&self) -> Option<(&str, &str)> {
        match (self.sasl_user.as_deref(), self.sasl_pass.as_deref()) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }

    /// Splits `host:port` into its halves, defaulting the port by TLS use.
    pub fn server_host_port(&self) -> (String, u16) {
        match self.server.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_owned(), port),
                Err(_) => (self.server.clone(), self.default_port()),
            },
            None => (self.server.clone(), self.default_port()),
        }
    }

    fn default_port(&self) -> u16 {
        if self.use_tls {
            6697
        } else {
            6667
        }
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("not a boolean: {}", other))),
    }
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
