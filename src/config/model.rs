//! Typed configuration model.
//!
//! Cross-references between categories, command sets, access lists and
//! connections are by id only; the validation pass (`config::validate`)
//! checks them at load and `ConfigSnapshot` builds the lookup indexes. Live
//! config is an immutable snapshot behind an atomic pointer — mutation means
//! building and swapping a whole new snapshot.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// Top-level application configuration as parsed from the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub logging: LogSettings,
    pub categories: Vec<Category>,
    pub connections: Vec<Connection>,
    pub command_sets: Vec<CommandSet>,
    pub access_lists: Vec<AccessList>,
    #[serde(rename = "final")]
    pub final_rule: FinalRule,
    pub admins: Vec<i64>,
}

/// Listener settings for the frontend WebSocket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub ws_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            ws_port: 8765,
        }
    }
}

/// Logging settings (level name plus optional file output).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: None,
        }
    }
}

/// A group of command sets a user picks a style from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Category {
    pub id: String,
    pub display_name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub order: i32,
    pub enabled: bool,
    pub allow_user_switch: bool,
    pub is_mutex: bool,
    pub default_command_set: Option<String>,
}

impl Default for Category {
    fn default() -> Self {
        Self {
            id: String::new(),
            display_name: String::new(),
            description: None,
            icon: None,
            order: 0,
            enabled: true,
            allow_user_switch: true,
            is_mutex: true,
            default_command_set: None,
        }
    }
}

/// A named bundle of commands targeting one upstream connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSet {
    pub id: String,
    pub name: String,
    pub prefix: Option<String>,
    pub category: Option<String>,
    pub target_ws: Option<String>,
    pub is_public: bool,
    pub strip_prefix: bool,
    pub priority: i32,
    pub enabled: bool,
    pub is_default: bool,
    pub user_access_list: Option<String>,
    pub group_access_list: Option<String>,
    pub commands: Vec<Command>,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            prefix: None,
            category: None,
            target_ws: None,
            is_public: false,
            strip_prefix: false,
            priority: 0,
            enabled: true,
            is_default: false,
            user_access_list: None,
            group_access_list: None,
            commands: Vec::new(),
        }
    }
}

impl CommandSet {
    /// Find the command matching the head of `text`.
    ///
    /// A command matches when `text` equals its name (or an alias), or
    /// starts with the name followed by whitespace. Longest name wins so
    /// `/listen` is preferred over `/list` when both are configured.
    pub fn find_match(&self, text: &str) -> Option<&Command> {
        let mut matchers: Vec<(&str, &Command)> = Vec::new();
        for cmd in &self.commands {
            matchers.push((cmd.name.as_str(), cmd));
            for alias in &cmd.aliases {
                matchers.push((alias.as_str(), cmd));
            }
        }
        matchers.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        for (name, cmd) in matchers {
            if name.is_empty() {
                continue;
            }
            if text == name {
                return Some(cmd);
            }
            if let Some(rest) = text.strip_prefix(name) {
                if rest.starts_with(char::is_whitespace) {
                    return Some(cmd);
                }
            }
        }
        None
    }
}

/// One routable command within a set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    pub is_privileged: bool,
    pub time_restriction: Option<TimeWindow>,
}

/// Wall-clock availability window, local time, half-open `[start, end)`.
///
/// Windows with `end < start` wrap midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Whether `t` falls inside the window.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

const TIME_FMT: &str = "%H:%M";

impl Serialize for TimeWindow {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("TimeWindow", 2)?;
        s.serialize_field("start", &self.start.format(TIME_FMT).to_string())?;
        s.serialize_field("end", &self.end.format(TIME_FMT).to_string())?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for TimeWindow {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            start: String,
            end: String,
        }
        let raw = Raw::deserialize(deserializer)?;
        let start = NaiveTime::parse_from_str(&raw.start, TIME_FMT)
            .map_err(|e| serde::de::Error::custom(format!("bad start time {:?}: {e}", raw.start)))?;
        let end = NaiveTime::parse_from_str(&raw.end, TIME_FMT)
            .map_err(|e| serde::de::Error::custom(format!("bad end time {:?}: {e}", raw.end)))?;
        Ok(TimeWindow { start, end })
    }
}

/// Scope of an access list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessScope {
    User,
    Group,
}

/// Whether listed ids are the only ones allowed, or the ones denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Whitelist,
    Blacklist,
}

/// A named set of user or group ids used as a whitelist or blacklist guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessList {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub scope: AccessScope,
    pub mode: AccessMode,
    #[serde(default)]
    pub items: BTreeSet<i64>,
}

impl AccessList {
    /// Whether the guard admits the given id.
    pub fn permits(&self, id: i64) -> bool {
        match self.mode {
            AccessMode::Whitelist => self.items.contains(&id),
            AccessMode::Blacklist => !self.items.contains(&id),
        }
    }
}

/// One upstream backend the dispatcher keeps a WebSocket client to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Connection {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: Option<String>,
    pub auto_reconnect: bool,
    pub reconnect_interval_s: u64,
    pub allow_forward: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            url: String::new(),
            token: None,
            auto_reconnect: true,
            reconnect_interval_s: 5,
            allow_forward: false,
        }
    }
}

/// Fallback action for message events no command set claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalAction {
    Reject,
    Allow,
    Forward,
}

/// The final rule applied when resolution reaches the end of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalRule {
    pub action: FinalAction,
    pub target_ws: Option<String>,
    pub message: String,
    pub send_message: bool,
}

impl Default for FinalRule {
    fn default() -> Self {
        Self {
            action: FinalAction::Reject,
            target_ws: None,
            message: "未知指令".to_string(),
            send_message: true,
        }
    }
}

/// Immutable, index-carrying view of a validated [`AppConfig`].
///
/// Readers take one `Arc` clone and use that snapshot end to end; a decision
/// never observes a mix of two configs.
#[derive(Debug)]
pub struct ConfigSnapshot {
    config: AppConfig,
    sets_by_id: HashMap<String, usize>,
    categories_by_id: HashMap<String, usize>,
    connections_by_id: HashMap<String, usize>,
    access_lists_by_id: HashMap<String, usize>,
    /// Forced-dispatch tokens: command set `name` and `prefix` → set index.
    tokens: HashMap<String, usize>,
}

impl ConfigSnapshot {
    /// Build the indexed snapshot. The config is assumed validated; on
    /// duplicate ids the first occurrence wins, matching config order.
    pub fn build(config: AppConfig) -> Arc<Self> {
        let mut sets_by_id = HashMap::new();
        let mut tokens = HashMap::new();
        for (i, cs) in config.command_sets.iter().enumerate() {
            sets_by_id.entry(cs.id.clone()).or_insert(i);
            tokens.entry(cs.name.clone()).or_insert(i);
            if let Some(prefix) = &cs.prefix {
                if !prefix.is_empty() {
                    tokens.entry(prefix.clone()).or_insert(i);
                }
            }
        }

        let mut categories_by_id = HashMap::new();
        for (i, cat) in config.categories.iter().enumerate() {
            categories_by_id.entry(cat.id.clone()).or_insert(i);
        }

        let mut connections_by_id = HashMap::new();
        for (i, conn) in config.connections.iter().enumerate() {
            connections_by_id.entry(conn.id.clone()).or_insert(i);
        }

        let mut access_lists_by_id = HashMap::new();
        for (i, list) in config.access_lists.iter().enumerate() {
            access_lists_by_id.entry(list.id.clone()).or_insert(i);
        }

        Arc::new(Self {
            config,
            sets_by_id,
            categories_by_id,
            connections_by_id,
            access_lists_by_id,
            tokens,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn command_sets(&self) -> &[CommandSet] {
        &self.config.command_sets
    }

    pub fn categories(&self) -> &[Category] {
        &self.config.categories
    }

    pub fn connections(&self) -> &[Connection] {
        &self.config.connections
    }

    pub fn final_rule(&self) -> &FinalRule {
        &self.config.final_rule
    }

    pub fn command_set(&self, id: &str) -> Option<&CommandSet> {
        self.sets_by_id.get(id).map(|&i| &self.config.command_sets[i])
    }

    pub fn category(&self, id: &str) -> Option<&Category> {
        self.categories_by_id
            .get(id)
            .map(|&i| &self.config.categories[i])
    }

    pub fn connection(&self, id: &str) -> Option<&Connection> {
        self.connections_by_id
            .get(id)
            .map(|&i| &self.config.connections[i])
    }

    pub fn access_list(&self, id: &str) -> Option<&AccessList> {
        self.access_lists_by_id
            .get(id)
            .map(|&i| &self.config.access_lists[i])
    }

    /// Resolve a forced-dispatch token (set name or prefix), exact match.
    pub fn forced_set(&self, token: &str) -> Option<&CommandSet> {
        self.tokens.get(token).map(|&i| &self.config.command_sets[i])
    }

    /// Whether the given qq id is a configured admin.
    pub fn is_admin(&self, qq_id: i64) -> bool {
        self.config.admins.contains(&qq_id)
    }

    /// Enabled command sets belonging to the given category, config order.
    pub fn sets_in_category<'a>(
        &'a self,
        category_id: &'a str,
    ) -> impl Iterator<Item = &'a CommandSet> {
        self.config
            .command_sets
            .iter()
            .filter(move |cs| cs.category.as_deref() == Some(category_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_time_window_plain() {
        let w = TimeWindow {
            start: t(9, 0),
            end: t(17, 0),
        };
        assert!(w.contains(t(9, 0)));
        assert!(w.contains(t(12, 30)));
        assert!(!w.contains(t(17, 0)), "end is exclusive");
        assert!(!w.contains(t(8, 59)));
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let w = TimeWindow {
            start: t(22, 0),
            end: t(6, 0),
        };
        assert!(w.contains(t(23, 30)));
        assert!(w.contains(t(0, 0)));
        assert!(w.contains(t(5, 59)));
        assert!(!w.contains(t(6, 0)));
        assert!(!w.contains(t(10, 0)));
    }

    #[test]
    fn test_time_window_serde() {
        let json = r#"{"start": "22:00", "end": "06:00"}"#;
        let w: TimeWindow = serde_json::from_str(json).unwrap();
        assert_eq!(w.start, t(22, 0));
        assert_eq!(w.end, t(6, 0));

        let back = serde_json::to_value(w).unwrap();
        assert_eq!(back["start"], "22:00");
        assert_eq!(back["end"], "06:00");

        assert!(serde_json::from_str::<TimeWindow>(r#"{"start": "25:00", "end": "06:00"}"#).is_err());
    }

    #[test]
    fn test_access_list_modes() {
        let mut items = BTreeSet::new();
        items.insert(100);
        let white = AccessList {
            id: "w".into(),
            name: "w".into(),
            scope: AccessScope::User,
            mode: AccessMode::Whitelist,
            items: items.clone(),
        };
        assert!(white.permits(100));
        assert!(!white.permits(200));

        let black = AccessList {
            mode: AccessMode::Blacklist,
            ..white
        };
        assert!(!black.permits(100));
        assert!(black.permits(200));
    }

    #[test]
    fn test_find_match_longest_name_first() {
        let cs = CommandSet {
            id: "s".into(),
            name: "s".into(),
            commands: vec![
                Command {
                    name: "/list".into(),
                    ..Default::default()
                },
                Command {
                    name: "/listen".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert_eq!(cs.find_match("/listen now").unwrap().name, "/listen");
        assert_eq!(cs.find_match("/list").unwrap().name, "/list");
        // No whitespace boundary: "/listx" matches neither.
        assert!(cs.find_match("/listx").is_none());
    }

    #[test]
    fn test_find_match_aliases() {
        let cs = CommandSet {
            commands: vec![Command {
                name: "/info".into(),
                aliases: vec!["/i".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(cs.find_match("/i hello").unwrap().name, "/info");
    }

    #[test]
    fn test_snapshot_indexes() {
        let config = AppConfig {
            command_sets: vec![
                CommandSet {
                    id: "a".into(),
                    name: "bota".into(),
                    prefix: Some("ba".into()),
                    ..Default::default()
                },
                CommandSet {
                    id: "b".into(),
                    name: "botb".into(),
                    ..Default::default()
                },
            ],
            connections: vec![Connection {
                id: "c1".into(),
                ..Default::default()
            }],
            admins: vec![42],
            ..Default::default()
        };

        let snap = ConfigSnapshot::build(config);
        assert_eq!(snap.command_set("a").unwrap().name, "bota");
        assert_eq!(snap.forced_set("bota").unwrap().id, "a");
        assert_eq!(snap.forced_set("ba").unwrap().id, "a");
        assert!(snap.forced_set("nope").is_none());
        assert!(snap.connection("c1").is_some());
        assert!(snap.is_admin(42));
        assert!(!snap.is_admin(7));
    }

    #[test]
    fn test_config_defaults() {
        let config: AppConfig = json5::from_str("{}").unwrap();
        assert_eq!(config.server.ws_port, 8765);
        assert_eq!(config.final_rule.action, FinalAction::Reject);
        assert!(config.final_rule.send_message);
        assert_eq!(config.final_rule.message, "未知指令");
    }
}
