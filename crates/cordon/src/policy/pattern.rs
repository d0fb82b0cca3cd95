//! 命令模式匹配模块
//!
//! 本模块实现了规则模式到已编译匹配器的转换，支持：
//! - 正则表达式模式（`is_regex = true`）
//! - 通配符模式：`*` 匹配任意数量的任意字符，`?` 匹配单个字符
//!
//! 所有模式在规则加载时预编译；无效模式只使该条规则失效，
//! 不影响其余规则的加载。

use regex::Regex;

use super::types::PolicyError;

/// 已编译的规则模式
///
/// 通配符模式在编译时被翻译为锚定正则；两种变体在匹配时行为一致，
/// 保留标签只为序列化与诊断。
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    /// 正则表达式模式
    Regex(Regex),
    /// 通配符模式（已翻译为正则）
    Glob(Regex),
}

impl CompiledPattern {
    /// 编译规则模式
    ///
    /// # Arguments
    /// * `pattern` - 模式字符串
    /// * `is_regex` - 是否按正则表达式处理
    /// * `rule_id` - 规则 ID（用于错误信息）
    pub fn compile(pattern: &str, is_regex: bool, rule_id: &str) -> Result<Self, PolicyError> {
        if is_regex {
            let regex = Regex::new(pattern).map_err(|e| PolicyError::InvalidPattern {
                id: rule_id.to_string(),
                message: e.to_string(),
            })?;
            Ok(Self::Regex(regex))
        } else {
            let translated = glob_to_regex(pattern);
            let regex = Regex::new(&translated).map_err(|e| PolicyError::InvalidPattern {
                id: rule_id.to_string(),
                message: e.to_string(),
            })?;
            Ok(Self::Glob(regex))
        }
    }

    /// 检查命令是否匹配
    pub fn matches(&self, command: &str) -> bool {
        match self {
            Self::Regex(re) | Self::Glob(re) => re.is_match(command),
        }
    }
}

/// 将通配符模式转换为锚定正则表达式字符串
///
/// `*` 转换为 `.*`，`?` 转换为 `.`，其余正则特殊字符全部转义。
pub fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() * 2);
    regex.push('^');

    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            // 转义正则表达式特殊字符
            '.' | '+' | '^' | '$' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\' => {
                regex.push('\\');
                regex.push(ch);
            }
            _ => regex.push(ch),
        }
    }

    regex.push('$');
    regex
}


/// Property-based tests for glob pattern translation
#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    /// 生成不含通配符的命令名
    fn command_name_strategy() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,15}".prop_map(|s| s)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: 任何命令名都应匹配自身作为通配符模式
        #[test]
        fn prop_glob_exact_match_self(name in command_name_strategy()) {
            let pattern = CompiledPattern::compile(&name, false, "prop").unwrap();
            prop_assert!(pattern.matches(&name));
        }

        /// Property: `*` 模式匹配任何命令名
        #[test]
        fn prop_glob_star_matches_all(name in command_name_strategy()) {
            let pattern = CompiledPattern::compile("*", false, "prop").unwrap();
            prop_assert!(pattern.matches(&name));
        }

        /// Property: 前缀通配符匹配所有带该前缀的命令
        #[test]
        fn prop_glob_prefix_match(
            prefix in "[a-z]{1,5}",
            suffix in "[a-z0-9]{0,8}"
        ) {
            let value = format!("{}{}", prefix, suffix);
            let pattern = CompiledPattern::compile(&format!("{}*", prefix), false, "prop").unwrap();
            prop_assert!(pattern.matches(&value));
        }

        /// Property: 无通配符时匹配等同于字符串相等
        #[test]
        fn prop_glob_no_wildcard_exact(
            value in command_name_strategy(),
            pattern_str in command_name_strategy()
        ) {
            let pattern = CompiledPattern::compile(&pattern_str, false, "prop").unwrap();
            prop_assert_eq!(pattern.matches(&value), value == pattern_str);
        }

        /// Property: 通配符编译永不失败（特殊字符均被转义）
        #[test]
        fn prop_glob_compile_never_fails(pattern_str in "[a-z.(){}|*?+\\[\\]]{0,12}") {
            prop_assert!(CompiledPattern::compile(&pattern_str, false, "prop").is_ok());
        }
    }
}
