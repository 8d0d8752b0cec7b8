//! Pattern compilation and per-tool-call match evaluation.
//!
//! Regex and glob patterns are compiled once at rule load so evaluation
//! stays cheap on the hot path.

use crate::rules::Rule;
use ctrlai_core::{CtrlAiError, Result, ToolCall};
use regex::Regex;

/// Pre-compiled matchers for one rule.
#[derive(Debug, Clone, Default)]
pub struct CompiledMatcher {
    pub(crate) command_regex: Option<Regex>,
    pub(crate) url_regex: Option<Regex>,
    pub(crate) path_globs: Vec<glob::Pattern>,
}

/// Compile all pattern matchers for a rule.
///
/// Any invalid regex or glob rejects the rule — a rule with patterns that
/// fail compilation never enters the active set.
pub(crate) fn compile_matcher(rule: &mut Rule) -> Result<()> {
    let mut compiled = CompiledMatcher::default();

    if !rule.match_spec.command_regex.is_empty() {
        compiled.command_regex = Some(Regex::new(&rule.match_spec.command_regex).map_err(|e| {
            CtrlAiError::Rule(format!("rule {:?}: invalid command_regex: {e}", rule.name))
        })?);
    }

    if !rule.match_spec.url_regex.is_empty() {
        compiled.url_regex = Some(Regex::new(&rule.match_spec.url_regex).map_err(|e| {
            CtrlAiError::Rule(format!("rule {:?}: invalid url_regex: {e}", rule.name))
        })?);
    }

    for pattern in rule.match_spec.path.iter() {
        let compiled_glob = glob::Pattern::new(pattern).map_err(|e| {
            CtrlAiError::Rule(format!(
                "rule {:?}: invalid path glob {pattern:?}: {e}",
                rule.name
            ))
        })?;
        compiled.path_globs.push(compiled_glob);
    }

    rule.compiled = compiled;
    Ok(())
}

/// Whether a tool call satisfies a rule's conditions.
///
/// All set fields must hold (conjunction); within a list field any entry
/// matching suffices (disjunction).
pub(crate) fn matches_rule(rule: &Rule, agent_id: &str, tc: &ToolCall) -> bool {
    let spec = &rule.match_spec;

    // Tool name, case-insensitive.
    if !spec.tool.is_empty()
        && !spec.tool.iter().any(|t| t.eq_ignore_ascii_case(&tc.name))
    {
        return false;
    }

    // Agent ID, exact.
    if !spec.agent.is_empty() && spec.agent != agent_id {
        return false;
    }

    // The "action" argument field, case-insensitive. A tool call without
    // an action field cannot satisfy an action predicate.
    if !spec.action.is_empty() {
        let action_value = tc.string_arg("action");
        if action_value.is_empty() {
            return false;
        }
        if !spec
            .action
            .iter()
            .any(|a| a.eq_ignore_ascii_case(action_value))
        {
            return false;
        }
    }

    // The "path" argument field, glob match.
    if !rule.compiled.path_globs.is_empty() {
        let path_value = tc.string_arg("path");
        if path_value.is_empty() {
            return false;
        }
        if !rule
            .compiled
            .path_globs
            .iter()
            .any(|g| g.matches(path_value))
        {
            return false;
        }
    }

    // Raw argument substring, case-insensitive.
    if !spec.arg_contains.is_empty() {
        let raw_lower = tc.raw_or_serialized().to_lowercase();
        if !spec
            .arg_contains
            .iter()
            .any(|needle| raw_lower.contains(&needle.to_lowercase()))
        {
            return false;
        }
    }

    // The "command" argument field, regex search.
    if let Some(re) = &rule.compiled.command_regex {
        let command = tc.string_arg("command");
        if command.is_empty() || !re.is_match(command) {
            return false;
        }
    }

    // The "url" (or "targetUrl") argument field, regex search.
    if let Some(re) = &rule.compiled.url_regex {
        let mut url = tc.string_arg("url");
        if url.is_empty() {
            url = tc.string_arg("targetUrl");
        }
        if url.is_empty() || !re.is_match(url) {
            return false;
        }
    }

    true
}
