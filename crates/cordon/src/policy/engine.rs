//! 策略引擎
//!
//! 本模块实现 PolicyEngine，整合所有策略子系统：
//! - 危险模式扫描（先于规则匹配，命中即拒绝）
//! - 按优先级排序的规则匹配
//! - 审计日志（有界环形缓冲）
//! - 规则文件持久化
//!
//! 评估顺序是严格的：危险模式扫描不可被自定义规则绕过，
//! 只能通过引擎配置全局关闭。

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use super::builtin::builtin_rules;
use super::dangerous::DangerousScanner;
use super::pattern::CompiledPattern;
use super::types::{PolicyAction, PolicyError, PolicyEvaluation, PolicyRule, RuleConstraints};

/// 已编译的规则
///
/// 模式在加载时预编译，评估路径上不再做正则编译。
#[derive(Debug, Clone)]
struct CompiledRule {
    rule: PolicyRule,
    matcher: CompiledPattern,
}

impl CompiledRule {
    fn compile(rule: PolicyRule) -> Result<Self, PolicyError> {
        let matcher = CompiledPattern::compile(&rule.pattern, rule.is_regex, &rule.id)?;
        Ok(Self { rule, matcher })
    }
}

/// 策略观察者
///
/// 在构造时注册的回调接口，替代隐式的事件分发；
/// 所有方法都有空默认实现。
pub trait PolicyObserver: Send + Sync {
    /// 新规则加入后调用
    fn on_rule_added(&self, _rule: &PolicyRule) {}
    /// 规则移除后调用
    fn on_rule_removed(&self, _rule_id: &str) {}
    /// 每次评估完成后调用
    fn on_evaluation(&self, _evaluation: &PolicyEvaluation) {}
}

/// 策略引擎配置
#[derive(Debug, Clone)]
pub struct PolicyEngineConfig {
    /// 无规则命中时的默认动作
    pub default_action: PolicyAction,
    /// 自定义规则文件路径
    pub rules_file: Option<PathBuf>,
    /// 是否启用危险模式扫描
    pub detect_dangerous: bool,
    /// 是否启用审计日志
    pub audit_enabled: bool,
    /// 审计日志最大条数
    pub max_audit_entries: usize,
}

impl Default for PolicyEngineConfig {
    fn default() -> Self {
        Self {
            default_action: PolicyAction::Ask,
            rules_file: Some(default_rules_file()),
            detect_dangerous: true,
            audit_enabled: true,
            max_audit_entries: 1000,
        }
    }
}

/// 默认规则文件路径：`~/.cordon/execpolicy.json`
pub fn default_rules_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("~"))
        .join(".cordon")
        .join("execpolicy.json")
}

/// 策略引擎
///
/// 规则列表与审计日志仅通过本引擎的方法变更；多线程场景下
/// 由调用方用互斥锁包裹整个引擎。
pub struct PolicyEngine {
    config: PolicyEngineConfig,
    /// 规则列表，始终按 priority 降序排列
    rules: Vec<CompiledRule>,
    /// 危险模式扫描器
    scanner: DangerousScanner,
    /// 审计日志（最旧的在队首）
    audit: VecDeque<PolicyEvaluation>,
    /// 观察者回调
    observers: Vec<Arc<dyn PolicyObserver>>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(PolicyEngineConfig::default())
    }
}

impl PolicyEngine {
    /// 创建新的策略引擎
    ///
    /// 内置规则始终加载；规则文件缺失或损坏时只记录日志，
    /// 引擎照常以内置规则运行。
    pub fn new(config: PolicyEngineConfig) -> Self {
        let mut scanner = DangerousScanner::new();
        scanner.set_enabled(config.detect_dangerous);

        let mut engine = Self {
            config,
            rules: Vec::new(),
            scanner,
            audit: VecDeque::new(),
            observers: Vec::new(),
        };

        for rule in builtin_rules() {
            match CompiledRule::compile(rule) {
                Ok(compiled) => engine.rules.push(compiled),
                Err(e) => warn!("Skipping built-in rule: {}", e),
            }
        }

        if let Err(e) = engine.load_rules() {
            warn!("Failed to load custom rules, continuing with built-ins: {}", e);
        }

        engine.sort_rules();
        engine
    }

    /// 注册观察者
    pub fn with_observer(mut self, observer: Arc<dyn PolicyObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// 获取当前配置
    pub fn config(&self) -> &PolicyEngineConfig {
        &self.config
    }

    /// 设置默认动作
    pub fn set_default_action(&mut self, action: PolicyAction) {
        self.config.default_action = action;
    }

    /// 开关危险模式扫描
    pub fn set_detect_dangerous(&mut self, enabled: bool) {
        self.config.detect_dangerous = enabled;
        self.scanner.set_enabled(enabled);
    }

    // =========================================================================
    // 评估
    // =========================================================================

    /// 评估一条命令
    ///
    /// 严格顺序：危险模式扫描 → 规则匹配 → 默认动作。
    /// 扫描命中始终返回 Deny，不受任何规则影响。
    pub fn evaluate(&mut self, command: &str, args: &[String], work_dir: &Path) -> PolicyEvaluation {
        let command_line = if args.is_empty() {
            command.to_string()
        } else {
            format!("{} {}", command, args.join(" "))
        };

        // 1. 危险模式扫描
        let dangerous = self
            .scanner
            .scan(&command_line)
            .map(|hit| (hit.description, hit.severity));
        if let Some((description, severity)) = dangerous {
            let reason = format!("Dangerous pattern: {} (severity: {})", description, severity);
            debug!(command = %command_line, %reason, "command denied by dangerous-pattern scan");
            let evaluation =
                PolicyEvaluation::new(command, args, work_dir, PolicyAction::Deny, reason);
            return self.finish(evaluation);
        }

        // 2. 规则匹配：列表已按优先级降序，首个命中即生效
        let matched = self
            .rules
            .iter()
            .find(|compiled| {
                let rule = &compiled.rule;
                rule.enabled
                    && compiled.matcher.matches(command)
                    && rule
                        .constraints
                        .as_ref()
                        .map_or(true, |c| constraints_match(c, args, work_dir))
            })
            .map(|compiled| compiled.rule.clone());
        if let Some(rule) = matched {
            let reason = format!("Matched rule '{}'", rule.name);
            debug!(command = %command_line, rule_id = %rule.id, action = %rule.action.name(), "rule matched");
            let evaluation = PolicyEvaluation::new(command, args, work_dir, rule.action, reason)
                .with_matched_rule(rule);
            return self.finish(evaluation);
        }

        // 3. 默认动作
        let evaluation = PolicyEvaluation::new(
            command,
            args,
            work_dir,
            self.config.default_action,
            "no matching rule",
        );
        self.finish(evaluation)
    }

    /// 便捷方法：命令是否被直接放行
    pub fn is_allowed(&mut self, command: &str, args: &[String], work_dir: &Path) -> bool {
        self.evaluate(command, args, work_dir).action == PolicyAction::Allow
    }

    /// 记录审计并通知观察者
    fn finish(&mut self, evaluation: PolicyEvaluation) -> PolicyEvaluation {
        if self.config.audit_enabled {
            self.audit.push_back(evaluation.clone());
            while self.audit.len() > self.config.max_audit_entries {
                self.audit.pop_front();
            }
        }
        for observer in &self.observers {
            observer.on_evaluation(&evaluation);
        }
        evaluation
    }

    // =========================================================================
    // 规则管理
    // =========================================================================

    /// 添加自定义规则
    ///
    /// 模式在此处编译验证；与现有规则 ID 冲突视为错误。
    /// 变更后重新排序并尽力持久化。
    pub fn add_rule(&mut self, rule: PolicyRule) -> Result<(), PolicyError> {
        if self.rules.iter().any(|c| c.rule.id == rule.id) {
            return Err(PolicyError::InvalidPattern {
                id: rule.id.clone(),
                message: "rule id already exists".to_string(),
            });
        }
        let compiled = CompiledRule::compile(rule)?;
        for observer in &self.observers {
            observer.on_rule_added(&compiled.rule);
        }
        self.rules.push(compiled);
        self.sort_rules();
        self.persist_best_effort();
        Ok(())
    }

    /// 移除自定义规则（内置规则不可移除）
    pub fn remove_rule(&mut self, rule_id: &str) -> Result<(), PolicyError> {
        let index = self
            .rules
            .iter()
            .position(|c| c.rule.id == rule_id)
            .ok_or_else(|| PolicyError::RuleNotFound(rule_id.to_string()))?;
        if self.rules[index].rule.is_builtin() {
            return Err(PolicyError::BuiltinImmutable(rule_id.to_string()));
        }
        self.rules.remove(index);
        for observer in &self.observers {
            observer.on_rule_removed(rule_id);
        }
        self.sort_rules();
        self.persist_best_effort();
        Ok(())
    }

    /// 更新自定义规则（内置规则不可更新）
    pub fn update_rule(&mut self, rule: PolicyRule) -> Result<(), PolicyError> {
        let index = self
            .rules
            .iter()
            .position(|c| c.rule.id == rule.id)
            .ok_or_else(|| PolicyError::RuleNotFound(rule.id.clone()))?;
        if self.rules[index].rule.is_builtin() {
            return Err(PolicyError::BuiltinImmutable(rule.id));
        }
        self.rules[index] = CompiledRule::compile(rule)?;
        self.sort_rules();
        self.persist_best_effort();
        Ok(())
    }

    /// 列出规则（按优先级降序）
    pub fn list_rules(&self, include_builtin: bool) -> Vec<PolicyRule> {
        self.rules
            .iter()
            .map(|c| &c.rule)
            .filter(|r| include_builtin || !r.is_builtin())
            .cloned()
            .collect()
    }

    /// 查找规则
    pub fn get_rule(&self, rule_id: &str) -> Option<&PolicyRule> {
        self.rules
            .iter()
            .find(|c| c.rule.id == rule_id)
            .map(|c| &c.rule)
    }

    /// 规则总数（含内置）
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn sort_rules(&mut self) {
        // 稳定排序：优先级相同的规则保持加入顺序
        self.rules.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
    }

    // =========================================================================
    // 持久化
    // =========================================================================

    /// 从规则文件加载自定义规则
    ///
    /// 文件缺失不算错误；单条规则模式无效时跳过该条，
    /// 不影响其余规则。
    pub fn load_rules(&mut self) -> Result<(), PolicyError> {
        let Some(path) = self.config.rules_file.clone() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let content =
            std::fs::read_to_string(&path).map_err(|e| PolicyError::RulesFileRead(e.to_string()))?;
        let rules: Vec<PolicyRule> = serde_json::from_str(&content)?;

        // 替换现有自定义规则
        self.rules.retain(|c| c.rule.is_builtin());
        for rule in rules {
            if rule.is_builtin() {
                // 文件里伪装成内置的规则直接丢弃
                warn!(rule_id = %rule.id, "ignoring builtin-tagged rule from rules file");
                continue;
            }
            match CompiledRule::compile(rule) {
                Ok(compiled) => self.rules.push(compiled),
                Err(e) => warn!("Skipping invalid rule: {}", e),
            }
        }
        self.sort_rules();
        Ok(())
    }

    /// 保存自定义规则到规则文件
    pub fn save_rules(&self) -> Result<(), PolicyError> {
        let Some(path) = self.config.rules_file.clone() else {
            return Ok(());
        };
        self.export_rules(&path)
    }

    /// 导出自定义规则到指定路径（2 空格缩进的 JSON 数组）
    pub fn export_rules(&self, path: &Path) -> Result<(), PolicyError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let custom: Vec<&PolicyRule> = self
            .rules
            .iter()
            .map(|c| &c.rule)
            .filter(|r| !r.is_builtin())
            .collect();
        let content = serde_json::to_string_pretty(&custom)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn persist_best_effort(&self) {
        if let Err(e) = self.save_rules() {
            warn!("Failed to persist rules: {}", e);
        }
    }

    // =========================================================================
    // 审计
    // =========================================================================

    /// 获取审计日志（最新的在末尾；可选尾部截取）
    pub fn audit_log(&self, limit: Option<usize>) -> Vec<PolicyEvaluation> {
        let len = self.audit.len();
        let skip = match limit {
            Some(n) if n < len => len - n,
            _ => 0,
        };
        self.audit.iter().skip(skip).cloned().collect()
    }

    /// 清空审计日志
    pub fn clear_audit_log(&mut self) {
        self.audit.clear();
    }
}

/// 检查规则约束
///
/// - `allowed_args`: 列表存在且参数非空时，拼接参数串必须命中其一
/// - `denied_args`: 命中任意一条即失败
/// - `allowed_dirs`/`denied_dirs`: 工作目录前缀匹配
fn constraints_match(constraints: &RuleConstraints, args: &[String], work_dir: &Path) -> bool {
    let joined = args.join(" ");

    if let Some(ref allowed) = constraints.allowed_args {
        if !args.is_empty() {
            let hit = allowed
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .any(|re| re.is_match(&joined));
            if !hit {
                return false;
            }
        }
    }

    if let Some(ref denied) = constraints.denied_args {
        let hit = denied
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .any(|re| re.is_match(&joined));
        if hit {
            return false;
        }
    }

    if let Some(ref allowed_dirs) = constraints.allowed_dirs {
        if !allowed_dirs.is_empty() {
            let hit = allowed_dirs.iter().any(|d| work_dir.starts_with(d));
            if !hit {
                return false;
            }
        }
    }

    if let Some(ref denied_dirs) = constraints.denied_dirs {
        let hit = denied_dirs.iter().any(|d| work_dir.starts_with(d));
        if hit {
            return false;
        }
    }

    true
}

// =============================================================================
// 单元测试
// =============================================================================
