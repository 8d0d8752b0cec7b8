//! Rule schema and the `rules.yaml` file format.

use crate::matcher::CompiledMatcher;
use ctrlai_core::{CtrlAiError, Result, RuleAction};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// String-or-list YAML fields
// ---------------------------------------------------------------------------

/// A YAML field that accepts either a single scalar or a sequence:
///
/// ```yaml
/// tool: exec          # single string
/// tool: [exec, read]  # list of strings
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StringOrList(pub Vec<String>);

impl StringOrList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for StringOrList {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::One(s) => StringOrList(vec![s]),
            Raw::Many(list) => StringOrList(list),
        })
    }
}

impl<const N: usize> From<[&str; N]> for StringOrList {
    fn from(items: [&str; N]) -> Self {
        StringOrList(items.iter().map(|s| s.to_string()).collect())
    }
}

// ---------------------------------------------------------------------------
// Rule schema
// ---------------------------------------------------------------------------

/// A single guardrail rule: a match condition plus the action taken when
/// the condition is met.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(rename = "match", default)]
    pub match_spec: RuleMatch,
    #[serde(default = "default_rule_action")]
    pub action: RuleAction,
    #[serde(default)]
    pub message: String,
    /// True for catalogue rules. Never serialized — built-ins live in code
    /// and are toggled, not stored.
    #[serde(skip)]
    pub builtin: bool,
    /// Pre-compiled regex/glob matchers, established at load time and
    /// never mutated once attached.
    #[serde(skip)]
    pub compiled: CompiledMatcher,
}

/// Rules written without an explicit action block — a guardrail that
/// silently allows is the rarer intent and must be asked for.
fn default_rule_action() -> RuleAction {
    RuleAction::Block
}

/// The conditions under which a rule fires.
///
/// All set fields must be satisfied (conjunction across fields); within a
/// list field any entry matching suffices (disjunction within the list).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleMatch {
    /// Tool names, case-insensitive.
    #[serde(skip_serializing_if = "StringOrList::is_empty")]
    pub tool: StringOrList,
    /// Values of the `action` argument field, case-insensitive.
    #[serde(skip_serializing_if = "StringOrList::is_empty")]
    pub action: StringOrList,
    /// Agent ID, exact match.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub agent: String,
    /// Glob patterns against the `path` argument field.
    #[serde(skip_serializing_if = "StringOrList::is_empty")]
    pub path: StringOrList,
    /// Case-insensitive substrings searched over the raw argument JSON.
    #[serde(skip_serializing_if = "StringOrList::is_empty")]
    pub arg_contains: StringOrList,
    /// Regex against the `command` argument field.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command_regex: String,
    /// Regex against the `url` (or `targetUrl`) argument field.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url_regex: String,
}

// ---------------------------------------------------------------------------
// rules.yaml envelope
// ---------------------------------------------------------------------------

/// The YAML envelope for `rules.yaml`: custom rules plus the built-in
/// toggle map.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<Rule>,
    #[serde(default)]
    builtin: Option<BTreeMap<String, bool>>,
}

/// Read custom rules and built-in toggles from a YAML file.
///
/// A missing or empty file yields no custom rules and no toggles
/// (the caller falls back to catalogue defaults).
pub fn load_rules_from_file(path: &Path) -> Result<(Vec<Rule>, Option<BTreeMap<String, bool>>)> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((Vec::new(), None));
        }
        Err(e) => return Err(e.into()),
    };

    if data.trim().is_empty() {
        return Ok((Vec::new(), None));
    }

    let file: RulesFile = serde_yaml::from_str(&data)
        .map_err(|e| CtrlAiError::Rule(format!("parsing rules {}: {e}", path.display())))?;
    Ok((file.rules, file.builtin))
}

/// Persist custom rules and built-in toggles to a YAML file.
pub fn save_rules_to_file(
    path: &Path,
    custom_rules: &[Rule],
    builtin_toggles: &BTreeMap<String, bool>,
) -> Result<()> {
    let file = RulesFile {
        rules: custom_rules.to_vec(),
        builtin: Some(builtin_toggles.clone()),
    };
    let body = serde_yaml::to_string(&file)?;
    let header = "# CtrlAI guardrail rules\n# Custom rules run after the enabled built-ins, in declared order.\n\n";
    std::fs::write(path, format!("{header}{body}"))?;
    Ok(())
}

/// Seed a default `rules.yaml` with catalogue toggles only.
pub fn write_default_rules(path: &Path) -> Result<()> {
    save_rules_to_file(path, &[], &crate::builtin::default_builtin_toggles())
}
