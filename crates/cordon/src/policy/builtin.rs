//! 内置策略规则
//!
//! 本模块定义引擎自带的规则集。内置规则始终带有 `builtin` 标签，
//! 不可删除或修改，可在列表查询时过滤。优先级区间 80-100，
//! 自定义规则可以用更高优先级覆盖（危险模式扫描除外）。

use super::types::{PolicyAction, PolicyRule, RuleConstraints, BUILTIN_TAG};

/// 构建内置规则列表
pub fn builtin_rules() -> Vec<PolicyRule> {
    let tag = vec![BUILTIN_TAG.to_string()];

    vec![
        // 只读命令直接放行
        PolicyRule::new(
            "safe read-only commands",
            r"^(ls|cat|head|tail|pwd|echo|printf|grep|rg|find|wc|which|file|stat|du|df|date|env|whoami|uname)$",
            PolicyAction::Allow,
        )
        .with_id("builtin-safe-read")
        .with_regex(true)
        .with_priority(100)
        .with_tags(tag.clone()),
        // 提权命令一律拒绝
        PolicyRule::new(
            "privilege escalation",
            r"^(sudo|doas|su)$",
            PolicyAction::Deny,
        )
        .with_id("builtin-privilege-escalation")
        .with_regex(true)
        .with_priority(95)
        .with_tags(tag.clone()),
        // shell 解释器必须进沙箱
        PolicyRule::new(
            "shell interpreters",
            r"^(bash|sh|zsh|dash|fish|ksh)$",
            PolicyAction::Sandbox,
        )
        .with_id("builtin-shell-interpreter")
        .with_regex(true)
        .with_priority(90)
        .with_constraints(RuleConstraints::new().with_require_sandbox(true))
        .with_tags(tag.clone()),
        // git 只读子命令放行
        PolicyRule::new(
            "git read-only subcommands",
            r"^git$",
            PolicyAction::Allow,
        )
        .with_id("builtin-git-read")
        .with_regex(true)
        .with_priority(88)
        .with_constraints(RuleConstraints::new().with_allowed_args(vec![
            r"^(status|log|diff|show|branch|remote|tag|stash list)".to_string(),
        ]))
        .with_tags(tag.clone()),
        // git 强制推送需要确认
        PolicyRule::new(
            "git force push",
            r"^git$",
            PolicyAction::Ask,
        )
        .with_id("builtin-git-force-push")
        .with_regex(true)
        .with_priority(85)
        .with_constraints(
            RuleConstraints::new()
                .with_allowed_args(vec![r"push\s+.*(--force|-f\b)".to_string()]),
        )
        .with_tags(tag.clone()),
        // 包管理器需要确认
        PolicyRule::new(
            "package managers",
            r"^(npm|npx|pnpm|yarn|pip|pip3|gem|cargo|apt|apt-get|dnf|brew)$",
            PolicyAction::Ask,
        )
        .with_id("builtin-package-manager")
        .with_regex(true)
        .with_priority(80)
        .with_tags(tag),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_builtin_rules_tagged() {
        for rule in builtin_rules() {
            assert!(rule.is_builtin(), "rule {} missing builtin tag", rule.id);
            assert!(rule.enabled);
        }
    }

    #[test]
    fn test_builtin_rule_ids_unique() {
        let rules = builtin_rules();
        let mut ids: Vec<_> = rules.iter().map(|r| r.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), rules.len());
    }

    #[test]
    fn test_shell_rule_requires_sandbox() {
        let rules = builtin_rules();
        let shell = rules
            .iter()
            .find(|r| r.id == "builtin-shell-interpreter")
            .unwrap();
        assert_eq!(shell.action, PolicyAction::Sandbox);
        assert_eq!(
            shell.constraints.as_ref().unwrap().require_sandbox,
            Some(true)
        );
    }

    #[test]
    fn test_priorities_descending_order_exists() {
        let rules = builtin_rules();
        let safe_read = rules.iter().find(|r| r.id == "builtin-safe-read").unwrap();
        let package = rules
            .iter()
            .find(|r| r.id == "builtin-package-manager")
            .unwrap();
        assert!(safe_read.priority > package.priority);
    }
}
