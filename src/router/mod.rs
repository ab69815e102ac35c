//! Command resolution.
//!
//! Turns one inbound message event into a routing decision by running the
//! staged pipeline: meta commands, forced dispatch, candidate assembly,
//! prefix promotion, command match with guards, final rule. The whole
//! pipeline is a pure function of the config snapshot, the user record, the
//! connectivity view and the supplied local time — it performs no I/O, so a
//! decision can be replayed (the admin dry-run does exactly that).

use std::collections::HashSet;

use chrono::NaiveTime;
use serde_json::Value;

use crate::config::model::{CommandSet, ConfigSnapshot, FinalAction};
use crate::onebot::MessageEvent;
use crate::users::UserRecord;

/// Reply used when a forced command set is disabled.
pub const REPLY_SET_DISABLED: &str = "指令集已禁用";
/// Reply used when an access list denies the caller.
pub const REPLY_ACCESS_DENIED: &str = "无权使用";
/// Reply used when a privileged command is invoked without privilege.
pub const REPLY_PRIVILEGE_REQUIRED: &str = "该指令需要特权";
/// Reply used when a command is invoked outside its time window.
pub const REPLY_OUTSIDE_TIME_WINDOW: &str = "不在可用时间";
/// Reply used when the target connection is missing or down.
pub const REPLY_TARGET_UNAVAILABLE: &str = "目标连接不可用";

/// Outcome of resolving one message event.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Forward the (possibly rewritten) event to an upstream connection.
    Forward { connection_id: String, payload: Value },
    /// Reply to the originating frontend with a synthesized text message.
    Reply { text: String },
    /// Silently ignore the event.
    Drop,
}

impl Decision {
    pub fn reply(text: impl Into<String>) -> Self {
        Decision::Reply { text: text.into() }
    }
}

/// A built-in meta command, parsed but not yet executed. The style manager
/// turns these into replies (some of them write to the repository, which is
/// why execution does not happen inside the pure pipeline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaCommand {
    Help,
    Status,
    List { category: Option<String> },
    StyleList,
    StyleCurrent,
    StyleSelect { category: String, set: String },
    StyleUsage,
    Admin { args: String },
}

/// What resolution produced: either a final decision, or a meta command the
/// style manager must execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Decided(Decision),
    Meta(MetaCommand),
}

/// Read-only view of which upstream connections are currently connected.
pub trait LinkView {
    fn is_connected(&self, conn_id: &str) -> bool;
}

impl LinkView for HashSet<String> {
    fn is_connected(&self, conn_id: &str) -> bool {
        self.contains(conn_id)
    }
}

/// One candidate command set, carrying the text it should match against
/// (prefix promotion may have rewritten it for this candidate only).
struct Candidate<'a> {
    idx: usize,
    text: &'a str,
    promoted: bool,
}

/// Resolve a message event against a config snapshot.
///
/// `now` is the only clock the pipeline sees; callers on the hot path pass
/// the current local time, tests pass a fixed one.
pub fn resolve(
    snap: &ConfigSnapshot,
    links: &dyn LinkView,
    event: &MessageEvent,
    user: &UserRecord,
    now: NaiveTime,
) -> Outcome {
    let text = event.text.trim();
    let is_admin = snap.is_admin(user.qq_id);
    let is_privileged = user.is_privileged || is_admin;

    // Stage A — meta commands. Reserved, cannot be shadowed.
    if let Some(meta) = parse_meta(text) {
        return Outcome::Meta(meta);
    }

    // Stage B — forced command-set dispatch: "<token> <rest>".
    if let Some((token, rest)) = split_token(text) {
        if let Some(set) = snap.forced_set(token) {
            if !set.enabled {
                return Outcome::Decided(Decision::reply(REPLY_SET_DISABLED));
            }
            let idx = snap
                .command_sets()
                .iter()
                .position(|cs| cs.id == set.id)
                .unwrap_or(0);
            let forced = vec![Candidate {
                idx,
                text: rest,
                promoted: true,
            }];
            return Outcome::Decided(match_candidates(
                snap,
                links,
                event,
                user,
                forced,
                is_admin,
                is_privileged,
                event.group_id,
                now,
            ));
        }
    }

    // Stage C — candidate assembly.
    let picked = assemble_candidates(snap, user);

    // Stage D — prefix promotion.
    let candidates = promote_prefixes(snap, picked, text);

    // Stages E/F.
    Outcome::Decided(match_candidates(
        snap,
        links,
        event,
        user,
        candidates,
        is_admin,
        is_privileged,
        event.group_id,
        now,
    ))
}

/// Stage A parser. Matches on the first whitespace-delimited token so user
/// commands like `/styleguide` are not captured.
fn parse_meta(text: &str) -> Option<MetaCommand> {
    let (head, rest) = match split_token(text) {
        Some((head, rest)) => (head, rest.trim()),
        None => (text, ""),
    };

    match head {
        "/help" => Some(MetaCommand::Help),
        "/status" => Some(MetaCommand::Status),
        "/list" => Some(MetaCommand::List {
            category: (!rest.is_empty()).then(|| rest.to_string()),
        }),
        "/admin" => Some(MetaCommand::Admin {
            args: rest.to_string(),
        }),
        "/style" => {
            let mut parts = rest.split_whitespace();
            match parts.next() {
                None | Some("list") => Some(MetaCommand::StyleList),
                Some("current") => Some(MetaCommand::StyleCurrent),
                Some("select") => {
                    let category = parts.next();
                    let set: Vec<&str> = parts.collect();
                    match (category, set.is_empty()) {
                        (Some(category), false) => Some(MetaCommand::StyleSelect {
                            category: category.to_string(),
                            set: set.join(" "),
                        }),
                        _ => Some(MetaCommand::StyleUsage),
                    }
                }
                Some(_) => Some(MetaCommand::StyleUsage),
            }
        }
        _ => None,
    }
}

/// Split `text` into its first token and the (non-empty) remainder.
fn split_token(text: &str) -> Option<(&str, &str)> {
    let (token, rest) = text.split_once(char::is_whitespace)?;
    let rest = rest.trim_start();
    if token.is_empty() || rest.is_empty() {
        return None;
    }
    Some((token, rest))
}

/// Stage C: public enabled sets, then per enabled category the user's
/// selection, else the category default, else (non-mutex) every enabled set
/// of the category. Ordered by descending priority, config order breaking
/// ties.
fn assemble_candidates(snap: &ConfigSnapshot, user: &UserRecord) -> Vec<usize> {
    let sets = snap.command_sets();
    let mut picked: Vec<usize> = Vec::new();
    fn push_unique(picked: &mut Vec<usize>, idx: usize) {
        if !picked.contains(&idx) {
            picked.push(idx);
        }
    }

    for (i, cs) in sets.iter().enumerate() {
        if cs.is_public && cs.enabled {
            push_unique(&mut picked, i);
        }
    }

    for cat in snap.categories().iter().filter(|c| c.enabled) {
        // A stale selection (removed set, or one moved to another category)
        // falls back to the category default.
        let selected = user.selected_styles.get(&cat.id).and_then(|sel_id| {
            sets.iter()
                .position(|cs| &cs.id == sel_id && cs.category.as_deref() == Some(cat.id.as_str()))
        });
        if let Some(i) = selected {
            push_unique(&mut picked, i);
            continue;
        }

        let default = cat
            .default_command_set
            .as_ref()
            .and_then(|id| sets.iter().position(|cs| &cs.id == id));
        if let Some(i) = default {
            push_unique(&mut picked, i);
            continue;
        }

        if !cat.is_mutex {
            for (i, cs) in sets.iter().enumerate() {
                if cs.category.as_deref() == Some(cat.id.as_str()) && cs.enabled {
                    push_unique(&mut picked, i);
                }
            }
        }
    }

    picked.sort_by_key(|&i| (std::cmp::Reverse(sets[i].priority), i));
    picked
}

/// Stage D: a candidate whose prefix matches `text` followed by an ASCII
/// space (or end-of-string) is promoted ahead of the rest and matches
/// against the remainder when `strip_prefix` is set. Everything else keeps
/// the original text.
fn promote_prefixes<'a>(
    snap: &ConfigSnapshot,
    picked: Vec<usize>,
    text: &'a str,
) -> Vec<Candidate<'a>> {
    let sets = snap.command_sets();
    let mut candidates: Vec<Candidate<'a>> = picked
        .into_iter()
        .map(|idx| {
            let cs = &sets[idx];
            match prefix_remainder(cs, text) {
                Some(rest) => Candidate {
                    idx,
                    text: if cs.strip_prefix { rest } else { text },
                    promoted: true,
                },
                None => Candidate {
                    idx,
                    text,
                    promoted: false,
                },
            }
        })
        .collect();

    // Stable: promoted candidates first, original order otherwise.
    candidates.sort_by_key(|c| !c.promoted);
    candidates
}

fn prefix_remainder<'a>(cs: &CommandSet, text: &'a str) -> Option<&'a str> {
    let prefix = cs.prefix.as_deref().filter(|p| !p.is_empty())?;
    let rest = text.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else if let Some(stripped) = rest.strip_prefix(' ') {
        Some(stripped.trim_start_matches(' '))
    } else {
        None
    }
}

/// Stages E and F: first matching (set, command) wins, guards applied in
/// order, then the final rule.
#[allow(clippy::too_many_arguments)]
fn match_candidates(
    snap: &ConfigSnapshot,
    links: &dyn LinkView,
    event: &MessageEvent,
    user: &UserRecord,
    candidates: Vec<Candidate<'_>>,
    is_admin: bool,
    is_privileged: bool,
    group_id: Option<i64>,
    now: NaiveTime,
) -> Decision {
    let sets = snap.command_sets();

    for cand in &candidates {
        let set = &sets[cand.idx];
        let Some(cmd) = set.find_match(cand.text) else {
            continue;
        };

        // Guard 1: enablement misses fall through to the next candidate.
        if !set.enabled {
            continue;
        }

        if !is_admin {
            // Guard 2: access lists. Deny is sticky — once the command has
            // been named, falling through would leak which other sets carry
            // it.
            if let Some(list_id) = &set.user_access_list {
                if let Some(list) = snap.access_list(list_id) {
                    if !list.permits(user.qq_id) {
                        return Decision::reply(REPLY_ACCESS_DENIED);
                    }
                }
            }
            if let (Some(list_id), Some(gid)) = (&set.group_access_list, group_id) {
                if let Some(list) = snap.access_list(list_id) {
                    if !list.permits(gid) {
                        return Decision::reply(REPLY_ACCESS_DENIED);
                    }
                }
            }

            // Guard 3: privilege.
            if cmd.is_privileged && !is_privileged {
                return Decision::reply(REPLY_PRIVILEGE_REQUIRED);
            }

            // Guard 4: time window.
            if let Some(window) = &cmd.time_restriction {
                if !window.contains(now) {
                    return Decision::reply(REPLY_OUTSIDE_TIME_WINDOW);
                }
            }
        }

        return match set.target_ws.as_deref() {
            Some(target) if links.is_connected(target) => Decision::Forward {
                connection_id: target.to_string(),
                payload: event.with_text(cand.text),
            },
            _ => Decision::reply(REPLY_TARGET_UNAVAILABLE),
        };
    }

    // Stage F — final rule.
    let rule = snap.final_rule();
    match rule.action {
        FinalAction::Reject => {
            if rule.send_message {
                Decision::reply(rule.message.clone())
            } else {
                Decision::Drop
            }
        }
        FinalAction::Allow => Decision::Drop,
        FinalAction::Forward => match &rule.target_ws {
            Some(target) => Decision::Forward {
                connection_id: target.clone(),
                payload: event.raw.clone(),
            },
            // Unreachable for validated configs.
            None => Decision::Drop,
        },
    }
}
