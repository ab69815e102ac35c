//! Built-in meta commands: `/help`, `/status`, `/list`, `/style`, `/admin`.
//!
//! The router parses these (Stage A) and hands them here for execution. The
//! style manager holds no state of its own — selections are written through
//! the user store, everything else is read from the config snapshot.

use std::sync::Arc;

use crate::config::model::{Category, CommandSet, ConfigSnapshot};
use crate::router::MetaCommand;
use crate::users::{UserRecord, UserStore};

/// Runtime counters shown by `/status`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusSummary {
    pub connections_connected: usize,
    pub connections_total: usize,
    pub messages_today: u64,
}

pub const REPLY_NOT_ADMIN: &str = "你没有管理员权限";
pub const REPLY_STORE_DOWN: &str = "存储暂不可用，请稍后再试";
pub const STYLE_USAGE: &str = "用法: /style [list|current|select <分类> <风格>]";

pub struct StyleManager {
    store: Arc<UserStore>,
}

impl StyleManager {
    pub fn new(store: Arc<UserStore>) -> Self {
        Self { store }
    }

    /// Execute a parsed meta command and produce the reply text.
    pub async fn handle(
        &self,
        meta: &MetaCommand,
        snap: &ConfigSnapshot,
        user: &UserRecord,
        status: StatusSummary,
    ) -> String {
        self.handle_inner(meta, snap, user, status, true).await
    }

    /// Like [`handle`](Self::handle) but without persisting anything —
    /// mutating commands run their checks and report the reply they would
    /// give. Used by the admin dry-run resolve.
    pub async fn handle_dry_run(
        &self,
        meta: &MetaCommand,
        snap: &ConfigSnapshot,
        user: &UserRecord,
        status: StatusSummary,
    ) -> String {
        self.handle_inner(meta, snap, user, status, false).await
    }

    async fn handle_inner(
        &self,
        meta: &MetaCommand,
        snap: &ConfigSnapshot,
        user: &UserRecord,
        status: StatusSummary,
        persist: bool,
    ) -> String {
        match meta {
            MetaCommand::Help => self.help(snap),
            MetaCommand::Status => self.status(snap, status),
            MetaCommand::List { category: None } => self.list_categories(snap),
            MetaCommand::List {
                category: Some(cat),
            } => self.list_sets(snap, user, cat),
            MetaCommand::StyleList => self.style_list(snap, user),
            MetaCommand::StyleCurrent => self.style_current(snap, user),
            MetaCommand::StyleSelect { category, set } => {
                self.style_select(snap, user, category, set, persist).await
            }
            MetaCommand::StyleUsage => STYLE_USAGE.to_string(),
            MetaCommand::Admin { args } => self.admin(snap, user, args, persist).await,
        }
    }

    fn help(&self, snap: &ConfigSnapshot) -> String {
        let mut lines = vec![
            "📖 指令帮助".to_string(),
            String::new(),
            "系统指令：".to_string(),
            "  /help - 显示帮助信息".to_string(),
            "  /status - 显示系统状态".to_string(),
            "  /list - 列出所有分类".to_string(),
            "  /list <分类> - 列出分类下的指令集".to_string(),
            "  /style list - 列出可选风格".to_string(),
            "  /style select <分类> <风格> - 选择风格".to_string(),
            "  /style current - 查看当前风格".to_string(),
        ];

        let switchable: Vec<&Category> = snap
            .categories()
            .iter()
            .filter(|c| c.enabled && c.allow_user_switch)
            .collect();
        if !switchable.is_empty() {
            lines.push(String::new());
            lines.push("可切换的分类：".to_string());
            for cat in switchable {
                lines.push(format!("  {} ({})", cat.display_name, cat.id));
            }
        }

        lines.push(String::new());
        lines.push("你也可以使用指令集前缀临时调用：".to_string());
        lines.push("  <指令集名称> <指令>".to_string());
        lines.join("\n")
    }

    fn status(&self, snap: &ConfigSnapshot, status: StatusSummary) -> String {
        let mut lines = vec!["📊 系统状态：".to_string(), String::new()];
        lines.push(format!("指令集: {} 个", snap.command_sets().len()));
        lines.push(format!("分类: {} 个", snap.categories().len()));
        lines.push(format!(
            "连接: {}/{} 在线",
            status.connections_connected, status.connections_total
        ));
        lines.push(format!("今日消息: {} 条", status.messages_today));
        lines.join("\n")
    }

    fn list_categories(&self, snap: &ConfigSnapshot) -> String {
        let mut lines = vec!["📂 可用分类：".to_string(), String::new()];
        let mut cats: Vec<&Category> = snap.categories().iter().filter(|c| c.enabled).collect();
        cats.sort_by_key(|c| c.order);

        if cats.is_empty() {
            lines.push("  暂无分类".to_string());
        }
        for cat in cats {
            lines.push(format!("  【{}】({})", cat.display_name, cat.id));
            lines.push(format!("    /list {}", cat.id));
        }
        lines.join("\n")
    }

    fn list_sets(&self, snap: &ConfigSnapshot, user: &UserRecord, query: &str) -> String {
        let Some(cat) = find_category(snap, query) else {
            return format!("分类 '{query}' 不存在");
        };

        let mut lines = vec![format!("📂 {}", cat.display_name)];
        if let Some(desc) = &cat.description {
            lines.push(String::new());
            lines.push(desc.clone());
        }
        lines.push(String::new());
        lines.push("可选风格：".to_string());

        let selected = user.selected_styles.get(&cat.id);
        for cs in snap.sets_in_category(&cat.id).filter(|cs| cs.enabled) {
            let current = if selected == Some(&cs.id) {
                " ✓ 当前"
            } else {
                ""
            };
            lines.push(format!("  【{}】{current}", cs.name));
        }
        lines.join("\n")
    }

    fn style_list(&self, snap: &ConfigSnapshot, user: &UserRecord) -> String {
        let mut lines = vec!["🎨 可选风格：".to_string(), String::new()];
        let mut any = false;

        for cat in snap
            .categories()
            .iter()
            .filter(|c| c.enabled && c.allow_user_switch)
        {
            let sets: Vec<&CommandSet> =
                snap.sets_in_category(&cat.id).filter(|cs| cs.enabled).collect();
            if sets.is_empty() {
                continue;
            }
            any = true;
            lines.push(format!("【{}】", cat.display_name));
            let selected = user.selected_styles.get(&cat.id);
            for cs in sets {
                let current = if selected == Some(&cs.id) { " ✓" } else { "" };
                lines.push(format!("  {}{current}", cs.name));
            }
            lines.push(String::new());
        }

        if !any {
            lines.push("  暂无可选风格".to_string());
        }
        lines.push("用法: /style select <分类> <风格>".to_string());
        lines.join("\n")
    }

    fn style_current(&self, snap: &ConfigSnapshot, user: &UserRecord) -> String {
        let mut lines = vec!["🎨 当前风格：".to_string(), String::new()];

        for (cat_id, set_id) in &user.selected_styles {
            let cat_name = snap
                .category(cat_id)
                .map(|c| c.display_name.as_str())
                .unwrap_or(cat_id.as_str());
            let set_name = snap
                .command_set(set_id)
                .map(|cs| cs.name.as_str())
                .unwrap_or(set_id.as_str());
            lines.push(format!("  {cat_name}: {set_name}"));
        }

        if lines.len() == 2 {
            lines.push("  暂未选择任何风格".to_string());
        }
        lines.join("\n")
    }

    async fn style_select(
        &self,
        snap: &ConfigSnapshot,
        user: &UserRecord,
        category: &str,
        set: &str,
        persist: bool,
    ) -> String {
        let Some(cat) = find_category(snap, category) else {
            return format!("分类 '{category}' 不存在");
        };

        if !cat.allow_user_switch && !snap.is_admin(user.qq_id) {
            return "此分类不允许用户切换风格，请联系管理员".to_string();
        }

        let Some(cs) = find_set_in_category(snap, &cat.id, set) else {
            return format!("分类 '{}' 下没有风格 '{set}'", cat.display_name);
        };
        if !cs.enabled {
            return format!("风格 '{}' 已禁用", cs.name);
        }

        let done = format!("✅ 已切换【{}】分类到【{}】风格", cat.display_name, cs.name);
        if !persist {
            return done;
        }

        let cat_id = cat.id.clone();
        let cs_id = cs.id.clone();
        match self
            .store
            .update(user.qq_id, move |u| {
                u.selected_styles.insert(cat_id, cs_id);
            })
            .await
        {
            Ok(_) => done,
            Err(e) => {
                tracing::error!(target: "dispatch", "style select persist failed: {e}");
                REPLY_STORE_DOWN.to_string()
            }
        }
    }

    async fn admin(
        &self,
        snap: &ConfigSnapshot,
        user: &UserRecord,
        args: &str,
        persist: bool,
    ) -> String {
        if !snap.is_admin(user.qq_id) {
            return REPLY_NOT_ADMIN.to_string();
        }

        let parts: Vec<&str> = args.split_whitespace().collect();
        if parts.is_empty() {
            return [
                "🔧 管理员指令：",
                "",
                "  /admin set <QQ号> <分类> <风格> - 为用户设置风格",
                "  /admin privilege <QQ号> [on|off] - 设置用户特权",
            ]
            .join("\n");
        }

        match parts[0] {
            "set" if parts.len() >= 4 => {
                let Ok(target_qq) = parts[1].parse::<i64>() else {
                    return "无效的管理员指令".to_string();
                };
                let Some(cat) = find_category(snap, parts[2]) else {
                    return format!("分类 '{}' 不存在", parts[2]);
                };
                let style_name = parts[3..].join(" ");
                let Some(cs) = find_set_in_category(snap, &cat.id, &style_name) else {
                    return format!("风格 '{style_name}' 不存在");
                };
                if !cs.enabled {
                    return format!("风格 '{}' 已禁用", cs.name);
                }

                let done = format!(
                    "✅ 已为用户 {target_qq} 设置 {} 风格为【{}】",
                    cat.display_name, cs.name
                );
                if !persist {
                    return done;
                }
                let cat_id = cat.id.clone();
                let cs_id = cs.id.clone();
                match self
                    .store
                    .update(target_qq, move |u| {
                        u.selected_styles.insert(cat_id, cs_id);
                    })
                    .await
                {
                    Ok(_) => done,
                    Err(_) => REPLY_STORE_DOWN.to_string(),
                }
            }
            "privilege" if parts.len() >= 2 => {
                let Ok(target_qq) = parts[1].parse::<i64>() else {
                    return "无效的管理员指令".to_string();
                };
                let enable = parts.get(2).map(|s| *s == "on").unwrap_or(true);
                let state = if enable { "开启" } else { "关闭" };
                let done = format!("✅ 已{state}用户 {target_qq} 的特权");
                if !persist {
                    return done;
                }
                match self
                    .store
                    .update(target_qq, move |u| u.is_privileged = enable)
                    .await
                {
                    Ok(_) => done,
                    Err(_) => REPLY_STORE_DOWN.to_string(),
                }
            }
            _ => "无效的管理员指令".to_string(),
        }
    }
}

/// Look a category up by id, falling back to display name.
fn find_category<'a>(snap: &'a ConfigSnapshot, query: &str) -> Option<&'a Category> {
    snap.category(query)
        .or_else(|| snap.categories().iter().find(|c| c.display_name == query))
}

/// Look a command set up within a category, by id or name.
fn find_set_in_category<'a>(
    snap: &'a ConfigSnapshot,
    cat_id: &'a str,
    query: &str,
) -> Option<&'a CommandSet> {
    snap.sets_in_category(cat_id)
        .find(|cs| cs.id == query || cs.name == query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{AppConfig, Category, CommandSet};
    use crate::users::MemoryRepository;

    fn snapshot() -> Arc<ConfigSnapshot> {
        ConfigSnapshot::build(AppConfig {
            admins: vec![42],
            categories: vec![
                Category {
                    id: "pjsk".into(),
                    display_name: "PJSK".into(),
                    ..Default::default()
                },
                Category {
                    id: "locked".into(),
                    display_name: "Locked".into(),
                    allow_user_switch: false,
                    ..Default::default()
                },
            ],
            command_sets: vec![
                CommandSet {
                    id: "set-a".into(),
                    name: "风格A".into(),
                    category: Some("pjsk".into()),
                    ..Default::default()
                },
                CommandSet {
                    id: "set-b".into(),
                    name: "风格B".into(),
                    category: Some("pjsk".into()),
                    ..Default::default()
                },
                CommandSet {
                    id: "set-l".into(),
                    name: "内部".into(),
                    category: Some("locked".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        })
    }

    fn manager() -> (StyleManager, Arc<UserStore>) {
        let store = Arc::new(UserStore::new(Arc::new(MemoryRepository::new())));
        (StyleManager::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_style_select_round_trip() {
        let snap = snapshot();
        let (mgr, store) = manager();
        let user = store.get_or_create(100, "").await.unwrap();

        let reply = mgr
            .handle(
                &MetaCommand::StyleSelect {
                    category: "pjsk".into(),
                    set: "风格B".into(),
                },
                &snap,
                &user,
                StatusSummary::default(),
            )
            .await;
        assert!(reply.contains("✅"), "{reply}");
        assert!(reply.contains("风格B"));

        // /style current reflects the write.
        let user = store.get_or_create(100, "").await.unwrap();
        let current = mgr
            .handle(
                &MetaCommand::StyleCurrent,
                &snap,
                &user,
                StatusSummary::default(),
            )
            .await;
        assert!(current.contains("PJSK: 风格B"), "{current}");
    }

    #[tokio::test]
    async fn test_select_locked_category_denied_for_users_not_admins() {
        let snap = snapshot();
        let (mgr, store) = manager();

        let user = store.get_or_create(100, "").await.unwrap();
        let reply = mgr
            .handle(
                &MetaCommand::StyleSelect {
                    category: "locked".into(),
                    set: "内部".into(),
                },
                &snap,
                &user,
                StatusSummary::default(),
            )
            .await;
        assert!(reply.contains("不允许"), "{reply}");

        let admin = store.get_or_create(42, "").await.unwrap();
        let reply = mgr
            .handle(
                &MetaCommand::StyleSelect {
                    category: "locked".into(),
                    set: "内部".into(),
                },
                &snap,
                &admin,
                StatusSummary::default(),
            )
            .await;
        assert!(reply.contains("✅"), "{reply}");
    }

    #[tokio::test]
    async fn test_select_unknown_targets() {
        let snap = snapshot();
        let (mgr, store) = manager();
        let user = store.get_or_create(100, "").await.unwrap();

        let reply = mgr
            .handle(
                &MetaCommand::StyleSelect {
                    category: "nope".into(),
                    set: "风格A".into(),
                },
                &snap,
                &user,
                StatusSummary::default(),
            )
            .await;
        assert_eq!(reply, "分类 'nope' 不存在");

        let reply = mgr
            .handle(
                &MetaCommand::StyleSelect {
                    category: "pjsk".into(),
                    set: "nope".into(),
                },
                &snap,
                &user,
                StatusSummary::default(),
            )
            .await;
        assert!(reply.contains("没有风格"), "{reply}");
    }

    #[tokio::test]
    async fn test_list_marks_current_selection() {
        let snap = snapshot();
        let (mgr, store) = manager();
        store
            .update(100, |u| {
                u.selected_styles.insert("pjsk".into(), "set-a".into());
            })
            .await
            .unwrap();
        let user = store.get_or_create(100, "").await.unwrap();

        let reply = mgr
            .handle(
                &MetaCommand::List {
                    category: Some("pjsk".into()),
                },
                &snap,
                &user,
                StatusSummary::default(),
            )
            .await;
        assert!(reply.contains("【风格A】 ✓ 当前"), "{reply}");
        assert!(reply.contains("【风格B】"));
    }

    #[tokio::test]
    async fn test_style_list_filters_locked_categories() {
        let snap = snapshot();
        let (mgr, store) = manager();
        let user = store.get_or_create(100, "").await.unwrap();

        let reply = mgr
            .handle(&MetaCommand::StyleList, &snap, &user, StatusSummary::default())
            .await;
        assert!(reply.contains("【PJSK】"));
        assert!(!reply.contains("【Locked】"), "{reply}");
    }

    #[tokio::test]
    async fn test_status_counts() {
        let snap = snapshot();
        let (mgr, store) = manager();
        let user = store.get_or_create(100, "").await.unwrap();

        let reply = mgr
            .handle(
                &MetaCommand::Status,
                &snap,
                &user,
                StatusSummary {
                    connections_connected: 1,
                    connections_total: 3,
                    messages_today: 512,
                },
            )
            .await;
        assert!(reply.contains("连接: 1/3 在线"), "{reply}");
        assert!(reply.contains("今日消息: 512 条"));
    }

    #[tokio::test]
    async fn test_admin_requires_admin() {
        let snap = snapshot();
        let (mgr, store) = manager();
        let user = store.get_or_create(100, "").await.unwrap();

        let reply = mgr
            .handle(
                &MetaCommand::Admin { args: "".into() },
                &snap,
                &user,
                StatusSummary::default(),
            )
            .await;
        assert_eq!(reply, REPLY_NOT_ADMIN);
    }

    #[tokio::test]
    async fn test_admin_set_and_privilege() {
        let snap = snapshot();
        let (mgr, store) = manager();
        let admin = store.get_or_create(42, "").await.unwrap();

        let reply = mgr
            .handle(
                &MetaCommand::Admin {
                    args: "set 100 pjsk 风格B".into(),
                },
                &snap,
                &admin,
                StatusSummary::default(),
            )
            .await;
        assert!(reply.contains("✅"), "{reply}");
        let target = store.get_or_create(100, "").await.unwrap();
        assert_eq!(
            target.selected_styles.get("pjsk").map(String::as_str),
            Some("set-b")
        );

        let reply = mgr
            .handle(
                &MetaCommand::Admin {
                    args: "privilege 100 on".into(),
                },
                &snap,
                &admin,
                StatusSummary::default(),
            )
            .await;
        assert!(reply.contains("✅"), "{reply}");
        let target = store.get_or_create(100, "").await.unwrap();
        assert!(target.is_privileged);
    }
}
