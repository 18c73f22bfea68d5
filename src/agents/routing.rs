use super::registry::{AgentInfo, AgentStatus};
use crate::tasks::{Task, TaskKind};
use std::fmt;
use std::sync::Arc;

pub const GENERALIST: &str = "generalist";

type Predicate = dyn Fn(&Task) -> bool + Send + Sync;

/// One `(predicate, label)` row of the routing table.
#[derive(Clone)]
pub struct RoutingRule {
    pub label: String,
    predicate: Arc<Predicate>,
}

impl RoutingRule {
    pub fn new<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Match on task kind, or on a title/description word starting with any keyword
    /// (case-insensitive).
    pub fn for_kind(label: &str, kind: TaskKind, keywords: &[&str]) -> Self {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self::new(label, move |task: &Task| {
            task.kind == kind
                || mentions(&task.title, &keywords)
                || mentions(&task.description, &keywords)
        })
    }

    pub fn matches(&self, task: &Task) -> bool {
        (self.predicate)(task)
    }
}

fn mentions(text: &str, keywords: &[String]) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .any(|word| keywords.iter().any(|k| word.starts_with(k.as_str())))
}

impl fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingRule")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Ordered specialist table. The first matching rule wins; no match falls back to
/// the default label.
#[derive(Debug, Clone)]
pub struct SpecialistRouter {
    rules: Vec<RoutingRule>,
    fallback: String,
}

impl Default for SpecialistRouter {
    fn default() -> Self {
        Self::new()
            .with_rule(RoutingRule::for_kind(
                "security-specialist",
                TaskKind::Security,
                &["security", "vulnerab", "auth", "xss", "csrf", "injection", "cve"],
            ))
            .with_rule(RoutingRule::for_kind(
                "debugger",
                TaskKind::Debug,
                &["bug", "crash", "panic", "regression", "broken"],
            ))
            .with_rule(RoutingRule::for_kind(
                "test-engineer",
                TaskKind::Test,
                &["test", "coverage", "flaky"],
            ))
            .with_rule(RoutingRule::for_kind(
                "reviewer",
                TaskKind::Review,
                &["review", "audit"],
            ))
            .with_rule(RoutingRule::for_kind(
                "tech-writer",
                TaskKind::Docs,
                &["docs", "documentation", "readme", "guide"],
            ))
            .with_rule(RoutingRule::for_kind(
                "refactorer",
                TaskKind::Refactor,
                &["refactor", "cleanup", "simplif"],
            ))
    }
}

impl SpecialistRouter {
    /// An empty table that routes everything to the generalist.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: GENERALIST.to_string(),
        }
    }

    pub fn with_rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_fallback(mut self, label: impl Into<String>) -> Self {
        self.fallback = label.into();
        self
    }

    pub fn route(&self, task: &Task) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matches(task))
            .map_or(self.fallback.as_str(), |rule| rule.label.as_str())
    }

    /// First live, idle agent advertising `label` as a capability.
    pub fn pick_agent<'a>(&self, label: &str, agents: &'a [AgentInfo]) -> Option<&'a AgentInfo> {
        agents.iter().find(|agent| {
            agent.alive
                && agent.record.status == AgentStatus::Idle
                && agent.record.has_capability(label)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRecord;
    use crate::tasks::NewTask;

    fn task(title: &str, kind: TaskKind) -> Task {
        Task::new(NewTask::new(title).with_kind(kind))
    }

    #[test]
    fn test_kind_routes_to_specialist() {
        let router = SpecialistRouter::default();
        assert_eq!(router.route(&task("Harden login", TaskKind::Security)), "security-specialist");
        assert_eq!(router.route(&task("Write guide", TaskKind::Docs)), "tech-writer");
        assert_eq!(router.route(&task("Add endpoint", TaskKind::Implement)), GENERALIST);
    }

    #[test]
    fn test_keywords_route_regardless_of_kind() {
        let router = SpecialistRouter::default();
        assert_eq!(
            router.route(&task("Fix XSS in comments", TaskKind::Implement)),
            "security-specialist"
        );
        assert_eq!(
            router.route(&task("Crash on startup", TaskKind::Implement)),
            "debugger"
        );
        assert_eq!(
            router.route(&task("Increase test coverage", TaskKind::Implement)),
            "test-engineer"
        );
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let router = SpecialistRouter::default();
        // Both security and test keywords: security comes first.
        assert_eq!(
            router.route(&task("Test auth token expiry", TaskKind::Test)),
            "security-specialist"
        );
    }

    #[test]
    fn test_keywords_are_literal_words() {
        let rule = RoutingRule::for_kind("ffi", TaskKind::Docs, &["(unclosed", "binding"]);
        assert!(rule.matches(&task("Regenerate FFI bindings", TaskKind::Implement)));
        assert!(!rule.matches(&task("Add unclosed tag check", TaskKind::Implement)));

        let kind_only = RoutingRule::for_kind("docs", TaskKind::Docs, &[]);
        assert!(!kind_only.matches(&task("Anything", TaskKind::Implement)));
        assert!(kind_only.matches(&task("Anything", TaskKind::Docs)));
    }

    #[test]
    fn test_custom_table_and_fallback() {
        let router = SpecialistRouter::new()
            .with_rule(RoutingRule::new("urgent", |t: &Task| t.priority >= 9))
            .with_fallback("anyone");
        let mut urgent = task("x", TaskKind::Implement);
        urgent.priority = 10;
        assert_eq!(router.route(&urgent), "urgent");
        assert_eq!(router.route(&task("x", TaskKind::Implement)), "anyone");
    }

    #[test]
    fn test_pick_agent_skips_dead_and_busy() {
        let router = SpecialistRouter::default();
        let mut busy = AgentRecord::new("a1", "worker", ["debugger"]);
        busy.status = AgentStatus::Busy;
        let agents = vec![
            AgentInfo {
                record: busy,
                alive: true,
                heartbeat_ttl_seconds: Some(30),
            },
            AgentInfo {
                record: AgentRecord::new("a2", "worker", ["debugger"]),
                alive: false,
                heartbeat_ttl_seconds: None,
            },
            AgentInfo {
                record: AgentRecord::new("a3", "worker", ["debugger"]),
                alive: true,
                heartbeat_ttl_seconds: Some(12),
            },
        ];

        let picked = router.pick_agent("debugger", &agents).unwrap();
        assert_eq!(picked.record.agent_id, "a3");
        assert!(router.pick_agent("reviewer", &agents).is_none());
    }
}
