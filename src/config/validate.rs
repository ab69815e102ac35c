//! Config validation with typed cross-reference checks.

use std::collections::HashSet;

use super::model::{AccessScope, AppConfig, FinalAction};

/// Severity of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Hard error — startup must abort; reload keeps the old snapshot.
    Error,
    /// Advisory — logged but does not prevent startup.
    Warning,
}

/// A single validation finding.
#[derive(Debug, Clone)]
pub struct Issue {
    pub severity: Severity,
    pub path: String,
    pub message: String,
}

impl Issue {
    fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            path: path.into(),
            message: message.into(),
        }
    }

    fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Meta-command prefixes reserved by the dispatcher itself.
pub const RESERVED_PREFIXES: &[&str] = &["/help", "/status", "/list", "/style", "/admin"];

/// Validate a parsed config.
///
/// Returns a (possibly empty) list of issues. Callers inspect each issue's
/// `severity` to decide whether to abort or merely warn.
pub fn validate(config: &AppConfig) -> Vec<Issue> {
    let mut issues = Vec::new();

    check_duplicate_ids(config, &mut issues);
    check_connections(config, &mut issues);
    check_categories(config, &mut issues);
    check_command_sets(config, &mut issues);
    check_final_rule(config, &mut issues);

    issues
}

/// Whether any issue is a hard error.
pub fn has_errors(issues: &[Issue]) -> bool {
    issues.iter().any(|i| i.severity == Severity::Error)
}

fn check_duplicate_ids(config: &AppConfig, issues: &mut Vec<Issue>) {
    let mut seen = HashSet::new();
    for (i, cat) in config.categories.iter().enumerate() {
        if cat.id.is_empty() {
            issues.push(Issue::error(
                format!(".categories[{i}].id"),
                "category id must not be empty",
            ));
        } else if !seen.insert(&cat.id) {
            issues.push(Issue::error(
                format!(".categories[{i}].id"),
                format!("duplicate category id {:?}", cat.id),
            ));
        }
    }

    let mut seen = HashSet::new();
    for (i, cs) in config.command_sets.iter().enumerate() {
        if cs.id.is_empty() {
            issues.push(Issue::error(
                format!(".command_sets[{i}].id"),
                "command set id must not be empty",
            ));
        } else if !seen.insert(&cs.id) {
            issues.push(Issue::error(
                format!(".command_sets[{i}].id"),
                format!("duplicate command set id {:?}", cs.id),
            ));
        }
    }

    let mut seen = HashSet::new();
    for (i, conn) in config.connections.iter().enumerate() {
        if conn.id.is_empty() {
            issues.push(Issue::error(
                format!(".connections[{i}].id"),
                "connection id must not be empty",
            ));
        } else if !seen.insert(&conn.id) {
            issues.push(Issue::error(
                format!(".connections[{i}].id"),
                format!("duplicate connection id {:?}", conn.id),
            ));
        }
    }

    let mut seen = HashSet::new();
    for (i, list) in config.access_lists.iter().enumerate() {
        if !seen.insert(&list.id) {
            issues.push(Issue::error(
                format!(".access_lists[{i}].id"),
                format!("duplicate access list id {:?}", list.id),
            ));
        }
    }
}

fn check_connections(config: &AppConfig, issues: &mut Vec<Issue>) {
    for (i, conn) in config.connections.iter().enumerate() {
        if conn.url.is_empty() {
            issues.push(Issue::error(
                format!(".connections[{i}].url"),
                "connection url must not be empty",
            ));
        } else if !conn.url.starts_with("ws://") && !conn.url.starts_with("wss://") {
            issues.push(Issue::warning(
                format!(".connections[{i}].url"),
                format!("url should be a ws:// or wss:// address, got {:?}", conn.url),
            ));
        }
        if conn.reconnect_interval_s == 0 {
            issues.push(Issue::warning(
                format!(".connections[{i}].reconnect_interval_s"),
                "reconnect interval of 0 retries without delay",
            ));
        }
    }
}

fn check_categories(config: &AppConfig, issues: &mut Vec<Issue>) {
    for (i, cat) in config.categories.iter().enumerate() {
        if let Some(default_id) = &cat.default_command_set {
            match config.command_sets.iter().find(|cs| &cs.id == default_id) {
                None => issues.push(Issue::error(
                    format!(".categories[{i}].default_command_set"),
                    format!("unknown command set id {default_id:?}"),
                )),
                Some(cs) if cs.category.as_deref() != Some(cat.id.as_str()) => {
                    issues.push(Issue::error(
                        format!(".categories[{i}].default_command_set"),
                        format!(
                            "command set {default_id:?} does not belong to category {:?}",
                            cat.id
                        ),
                    ));
                }
                Some(_) => {}
            }
        }

        if !config
            .command_sets
            .iter()
            .any(|cs| cs.category.as_deref() == Some(cat.id.as_str()))
        {
            issues.push(Issue::warning(
                format!(".categories[{i}]"),
                format!("category {:?} has no command sets", cat.id),
            ));
        }
    }
}

fn check_command_sets(config: &AppConfig, issues: &mut Vec<Issue>) {
    let mut tokens = HashSet::new();

    for (i, cs) in config.command_sets.iter().enumerate() {
        if cs.is_public && cs.category.is_some() {
            issues.push(Issue::error(
                format!(".command_sets[{i}]"),
                "a public command set must not belong to a category",
            ));
        }

        if let Some(cat_id) = &cs.category {
            if !config.categories.iter().any(|c| &c.id == cat_id) {
                issues.push(Issue::error(
                    format!(".command_sets[{i}].category"),
                    format!("unknown category id {cat_id:?}"),
                ));
            }
        }

        if let Some(target) = &cs.target_ws {
            if !config.connections.iter().any(|c| &c.id == target) {
                issues.push(Issue::error(
                    format!(".command_sets[{i}].target_ws"),
                    format!("unknown connection id {target:?}"),
                ));
            }
        }

        check_access_ref(
            config,
            cs.user_access_list.as_deref(),
            AccessScope::User,
            &format!(".command_sets[{i}].user_access_list"),
            issues,
        );
        check_access_ref(
            config,
            cs.group_access_list.as_deref(),
            AccessScope::Group,
            &format!(".command_sets[{i}].group_access_list"),
            issues,
        );

        if !tokens.insert(cs.name.clone()) {
            issues.push(Issue::warning(
                format!(".command_sets[{i}].name"),
                format!("token {:?} already names another command set", cs.name),
            ));
        }
        if let Some(prefix) = &cs.prefix {
            if prefix.is_empty() {
                issues.push(Issue::warning(
                    format!(".command_sets[{i}].prefix"),
                    "empty prefix is ignored; omit the field instead",
                ));
            } else if !tokens.insert(prefix.clone()) {
                issues.push(Issue::warning(
                    format!(".command_sets[{i}].prefix"),
                    format!("token {prefix:?} already used by another command set"),
                ));
            }
        }

        if cs.commands.is_empty() {
            issues.push(Issue::warning(
                format!(".command_sets[{i}].commands"),
                "command set has no commands and can never match",
            ));
        }
        for (j, cmd) in cs.commands.iter().enumerate() {
            if cmd.name.is_empty() {
                issues.push(Issue::error(
                    format!(".command_sets[{i}].commands[{j}].name"),
                    "command name must not be empty",
                ));
            } else if RESERVED_PREFIXES.contains(&cmd.name.as_str()) {
                issues.push(Issue::warning(
                    format!(".command_sets[{i}].commands[{j}].name"),
                    format!("{:?} is a built-in command and will shadow this one", cmd.name),
                ));
            }
        }
    }
}

fn check_access_ref(
    config: &AppConfig,
    list_id: Option<&str>,
    expected: AccessScope,
    path: &str,
    issues: &mut Vec<Issue>,
) {
    let Some(list_id) = list_id else {
        return;
    };
    match config.access_lists.iter().find(|l| l.id == list_id) {
        None => issues.push(Issue::error(
            path.to_string(),
            format!("unknown access list id {list_id:?}"),
        )),
        Some(list) if list.scope != expected => issues.push(Issue::error(
            path.to_string(),
            format!(
                "access list {list_id:?} has the wrong type for this guard (expected {:?})",
                expected
            ),
        )),
        Some(_) => {}
    }
}

fn check_final_rule(config: &AppConfig, issues: &mut Vec<Issue>) {
    let rule = &config.final_rule;
    if rule.action == FinalAction::Forward {
        match &rule.target_ws {
            None => issues.push(Issue::error(
                ".final.target_ws",
                "final action \"forward\" requires target_ws",
            )),
            Some(target) => {
                if !config.connections.iter().any(|c| &c.id == target) {
                    issues.push(Issue::error(
                        ".final.target_ws",
                        format!("unknown connection id {target:?}"),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{
        AccessList, AccessMode, Category, Command, CommandSet, Connection, FinalRule,
    };

    fn base_config() -> AppConfig {
        AppConfig {
            connections: vec![Connection {
                id: "c1".into(),
                name: "backend".into(),
                url: "ws://127.0.0.1:9000".into(),
                ..Default::default()
            }],
            categories: vec![Category {
                id: "pjsk".into(),
                display_name: "PJSK".into(),
                ..Default::default()
            }],
            command_sets: vec![CommandSet {
                id: "a".into(),
                name: "bota".into(),
                category: Some("pjsk".into()),
                target_ws: Some("c1".into()),
                commands: vec![Command {
                    name: "/sing".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config_has_no_errors() {
        let issues = validate(&base_config());
        assert!(!has_errors(&issues), "{issues:?}");
    }

    #[test]
    fn test_unknown_target_ws_is_error() {
        let mut config = base_config();
        config.command_sets[0].target_ws = Some("missing".into());
        let issues = validate(&config);
        assert!(has_errors(&issues));
        assert!(issues
            .iter()
            .any(|i| i.path == ".command_sets[0].target_ws"));
    }

    #[test]
    fn test_public_set_with_category_is_error() {
        let mut config = base_config();
        config.command_sets[0].is_public = true;
        let issues = validate(&config);
        assert!(has_errors(&issues));
    }

    #[test]
    fn test_default_command_set_must_match_category() {
        let mut config = base_config();
        config.categories[0].default_command_set = Some("a".into());
        assert!(!has_errors(&validate(&config)));

        // Point the default at a set from another category.
        config.command_sets.push(CommandSet {
            id: "other".into(),
            name: "other".into(),
            target_ws: Some("c1".into()),
            is_public: true,
            commands: vec![Command {
                name: "/x".into(),
                ..Default::default()
            }],
            ..Default::default()
        });
        config.categories[0].default_command_set = Some("other".into());
        assert!(has_errors(&validate(&config)));
    }

    #[test]
    fn test_access_list_scope_mismatch() {
        let mut config = base_config();
        config.access_lists.push(AccessList {
            id: "g1".into(),
            name: "groups".into(),
            scope: AccessScope::Group,
            mode: AccessMode::Whitelist,
            items: Default::default(),
        });
        config.command_sets[0].user_access_list = Some("g1".into());
        let issues = validate(&config);
        assert!(has_errors(&issues));
        assert!(issues
            .iter()
            .any(|i| i.path == ".command_sets[0].user_access_list"));
    }

    #[test]
    fn test_final_forward_requires_target() {
        let mut config = base_config();
        config.final_rule = FinalRule {
            action: FinalAction::Forward,
            target_ws: None,
            ..Default::default()
        };
        assert!(has_errors(&validate(&config)));

        config.final_rule.target_ws = Some("c1".into());
        assert!(!has_errors(&validate(&config)));
    }

    #[test]
    fn test_duplicate_ids_are_errors() {
        let mut config = base_config();
        config.connections.push(config.connections[0].clone());
        assert!(has_errors(&validate(&config)));
    }

    #[test]
    fn test_reserved_command_name_warns() {
        let mut config = base_config();
        config.command_sets[0].commands.push(Command {
            name: "/help".into(),
            ..Default::default()
        });
        let issues = validate(&config);
        assert!(!has_errors(&issues));
        assert!(issues.iter().any(|i| i.severity == Severity::Warning
            && i.path == ".command_sets[0].commands[1].name"));
    }
}
