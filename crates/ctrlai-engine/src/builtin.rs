//! The built-in security rule catalogue.
//!
//! Built-in rules are always present and individually toggled via the
//! `builtin` section of `rules.yaml`; they are never deleted. Coverage:
//!   - file system access to sensitive paths (SSH keys, .env, credentials)
//!   - destructive shell commands (rm -rf /, mkfs, dd, fork bomb)
//!   - credential exfiltration via network tools
//!   - privacy/surveillance (camera, screen recording, location)
//!   - messaging admin actions (kick, ban, timeout, role changes)
//!   - session/memory/cron tools (default off)
//!   - gateway config modification and restart

use crate::rules::{Rule, RuleMatch};
use ctrlai_core::RuleAction;
use std::collections::BTreeMap;

fn builtin(name: &str, match_spec: RuleMatch, message: &str) -> Rule {
    Rule {
        name: name.to_string(),
        match_spec,
        action: RuleAction::Block,
        message: message.to_string(),
        builtin: true,
        compiled: Default::default(),
    }
}

/// All built-in rules, in catalogue order. Enabled built-ins run before
/// custom rules.
pub fn builtin_rules() -> Vec<Rule> {
    vec![
        // --- File system ---
        builtin(
            "block_ssh_private_keys",
            RuleMatch {
                tool: ["exec", "read"].into(),
                arg_contains: [".ssh/id_"].into(),
                ..Default::default()
            },
            "Cannot access SSH private keys",
        ),
        builtin(
            "block_env_files",
            RuleMatch {
                tool: ["read", "write", "edit"].into(),
                path: ["**/.env"].into(),
                ..Default::default()
            },
            "Cannot access .env files",
        ),
        builtin(
            "block_credential_files",
            RuleMatch {
                tool: ["read", "write", "edit"].into(),
                arg_contains: [".aws/credentials"].into(),
                ..Default::default()
            },
            "Cannot access credential files",
        ),
        // Shell config writes match the common config filenames in any
        // argument, one rule per filename.
        builtin(
            "block_shell_config_write",
            RuleMatch {
                tool: ["write", "edit"].into(),
                arg_contains: [".bashrc"].into(),
                ..Default::default()
            },
            "Cannot modify shell configuration files",
        ),
        builtin(
            "block_shell_config_write_zsh",
            RuleMatch {
                tool: ["write", "edit"].into(),
                arg_contains: [".zshrc"].into(),
                ..Default::default()
            },
            "Cannot modify shell configuration files",
        ),
        builtin(
            "block_shell_config_write_profile",
            RuleMatch {
                tool: ["write", "edit"].into(),
                arg_contains: [".profile"].into(),
                ..Default::default()
            },
            "Cannot modify shell configuration files",
        ),
        builtin(
            "block_browser_passwords",
            RuleMatch {
                tool: ["read", "exec"].into(),
                arg_contains: ["Login Data"].into(),
                ..Default::default()
            },
            "Cannot access browser password databases",
        ),
        builtin(
            "block_private_key_content",
            RuleMatch {
                tool: ["write", "exec"].into(),
                arg_contains: ["PRIVATE KEY-----"].into(),
                ..Default::default()
            },
            "Cannot write or transmit private key content",
        ),
        builtin(
            "block_system_files",
            RuleMatch {
                tool: ["read", "write", "edit"].into(),
                arg_contains: ["/etc/shadow"].into(),
                ..Default::default()
            },
            "Cannot access system credential files",
        ),
        builtin(
            "block_self_modification",
            RuleMatch {
                tool: ["write", "edit"].into(),
                arg_contains: [".ctrlai/"].into(),
                ..Default::default()
            },
            "Cannot modify CtrlAI configuration directory",
        ),
        // --- Destructive commands ---
        builtin(
            "block_destructive_commands",
            RuleMatch {
                tool: ["exec"].into(),
                command_regex: r"rm\s+-rf\s+/|mkfs|dd\s+if=|:\(\)\{\s*:\|:&\s*\};:".to_string(),
                ..Default::default()
            },
            "Destructive command blocked",
        ),
        // --- Credential exfiltration ---
        builtin(
            "block_exfiltration",
            RuleMatch {
                tool: ["exec"].into(),
                command_regex: r"(curl|wget|nc|ncat).*\.(env|pem|key|credentials)".to_string(),
                ..Default::default()
            },
            "Credential exfiltration attempt blocked",
        ),
        // --- Privacy / surveillance ---
        // camera_snap, screen_record, location_get are action values of the
        // "nodes" tool, not tools of their own.
        builtin(
            "block_camera",
            RuleMatch {
                tool: ["nodes"].into(),
                action: ["camera_snap", "camera_clip", "camera_list"].into(),
                ..Default::default()
            },
            "Camera access blocked",
        ),
        builtin(
            "block_screen_record",
            RuleMatch {
                tool: ["nodes"].into(),
                action: ["screen_record"].into(),
                ..Default::default()
            },
            "Screen recording blocked",
        ),
        builtin(
            "block_location",
            RuleMatch {
                tool: ["nodes"].into(),
                action: ["location_get"].into(),
                ..Default::default()
            },
            "Location tracking blocked",
        ),
        builtin(
            "block_node_rce",
            RuleMatch {
                tool: ["nodes"].into(),
                action: ["run", "invoke"].into(),
                ..Default::default()
            },
            "Remote code execution on paired device blocked",
        ),
        // --- Messaging ---
        builtin(
            "block_unsolicited_messages",
            RuleMatch {
                tool: ["message"].into(),
                ..Default::default()
            },
            "Message tool usage blocked",
        ),
        builtin(
            "block_message_send",
            RuleMatch {
                tool: ["message"].into(),
                action: [
                    "send",
                    "sendWithEffect",
                    "sendAttachment",
                    "reply",
                    "thread-reply",
                    "broadcast",
                ]
                .into(),
                ..Default::default()
            },
            "Message sending blocked",
        ),
        builtin(
            "block_message_admin",
            RuleMatch {
                tool: ["message"].into(),
                action: ["kick", "ban", "timeout", "role-add", "role-remove"].into(),
                ..Default::default()
            },
            "Messaging admin action blocked",
        ),
        // --- Session tools ---
        builtin(
            "block_sessions_spawn",
            RuleMatch {
                tool: ["sessions_spawn"].into(),
                ..Default::default()
            },
            "Agent spawning blocked",
        ),
        builtin(
            "block_sessions_send",
            RuleMatch {
                tool: ["sessions_send"].into(),
                ..Default::default()
            },
            "Cross-session messaging blocked",
        ),
        // --- Memory tools ---
        builtin(
            "block_memory_search",
            RuleMatch {
                tool: ["memory_search"].into(),
                ..Default::default()
            },
            "Memory search blocked",
        ),
        builtin(
            "block_memory_get",
            RuleMatch {
                tool: ["memory_get"].into(),
                ..Default::default()
            },
            "Memory access blocked",
        ),
        // --- Persistence / cron ---
        builtin(
            "block_cron_create",
            RuleMatch {
                tool: ["cron"].into(),
                action: ["add"].into(),
                ..Default::default()
            },
            "Cron job creation blocked",
        ),
        // --- Gateway ---
        builtin(
            "block_gateway_modify",
            RuleMatch {
                tool: ["gateway"].into(),
                action: ["config.apply", "config.patch"].into(),
                ..Default::default()
            },
            "Gateway configuration modification blocked",
        ),
        builtin(
            "block_gateway_restart",
            RuleMatch {
                tool: ["gateway"].into(),
                action: ["restart"].into(),
                ..Default::default()
            },
            "Gateway restart blocked",
        ),
    ]
}

/// Default enable/disable state for each built-in rule.
pub fn default_builtin_toggles() -> BTreeMap<String, bool> {
    let mut toggles = BTreeMap::new();
    for (name, enabled) in [
        // File system — all on by default.
        ("block_ssh_private_keys", true),
        ("block_env_files", true),
        ("block_credential_files", true),
        ("block_shell_config_write", true),
        ("block_shell_config_write_zsh", true),
        ("block_shell_config_write_profile", true),
        ("block_browser_passwords", true),
        ("block_private_key_content", true),
        ("block_system_files", true),
        ("block_self_modification", true),
        // Destructive commands — on.
        ("block_destructive_commands", true),
        ("block_exfiltration", true),
        // Privacy/surveillance — on.
        ("block_camera", true),
        ("block_screen_record", true),
        ("block_location", true),
        ("block_node_rce", true),
        // Messaging — admin on, send off.
        ("block_unsolicited_messages", false),
        ("block_message_send", false),
        ("block_message_admin", true),
        // Session tools — off.
        ("block_sessions_spawn", false),
        ("block_sessions_send", false),
        // Memory — off.
        ("block_memory_search", false),
        ("block_memory_get", false),
        // Persistence/admin.
        ("block_cron_create", false),
        ("block_gateway_modify", true),
        ("block_gateway_restart", true),
    ] {
        toggles.insert(name.to_string(), enabled);
    }
    toggles
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_every_rule_has_a_toggle() {
        let toggles = default_builtin_toggles();
        for rule in builtin_rules() {
            assert!(
                toggles.contains_key(&rule.name),
                "missing toggle for {}",
                rule.name
            );
        }
        assert_eq!(toggles.len(), builtin_rules().len());
    }

    #[test]
    fn test_rule_names_are_unique() {
        let names: BTreeSet<String> = builtin_rules().into_iter().map(|r| r.name).collect();
        assert_eq!(names.len(), builtin_rules().len());
    }

    #[test]
    fn test_all_builtins_marked_builtin_and_block() {
        for rule in builtin_rules() {
            assert!(rule.builtin, "{} not marked builtin", rule.name);
            assert_eq!(rule.action, RuleAction::Block, "{} not block", rule.name);
            assert!(!rule.message.is_empty(), "{} missing message", rule.name);
        }
    }

    #[test]
    fn test_default_off_set() {
        let toggles = default_builtin_toggles();
        for name in [
            "block_unsolicited_messages",
            "block_message_send",
            "block_sessions_spawn",
            "block_sessions_send",
            "block_memory_search",
            "block_memory_get",
            "block_cron_create",
        ] {
            assert_eq!(toggles.get(name), Some(&false), "{name} should be off");
        }
    }

    #[test]
    fn test_all_patterns_compile() {
        for mut rule in builtin_rules() {
            crate::matcher::compile_matcher(&mut rule)
                .unwrap_or_else(|e| panic!("{} failed to compile: {e}", rule.name));
        }
    }
}
