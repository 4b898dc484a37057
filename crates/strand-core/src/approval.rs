use serde::{Deserialize, Serialize};

use crate::events::TurnEvent;

/// When the engine must ask before running privileged actions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    #[default]
    Never,
    Untrusted,
    OnFailure,
    OnRequest,
}

impl ApprovalPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Untrusted => "untrusted",
            Self::OnFailure => "on-failure",
            Self::OnRequest => "on-request",
        }
    }

    /// Whether shell commands need explicit user confirmation.
    pub fn gates_commands(&self) -> bool {
        !matches!(self, Self::Never)
    }
}

/// A declined privileged action awaiting the user's confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_detail: Option<String>,
}

const AFFIRMATIVE: &[&str] = &["yes", "y", "approve"];

impl PendingApproval {
    pub fn new(action_type: impl Into<String>, action_detail: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            action_detail: Some(action_detail.into()),
        }
    }

    /// Prompt that re-issues the declined action after the user approved it.
    pub fn retry_prompt(&self) -> String {
        let action = self
            .action_detail
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(if self.action_type.is_empty() { "the action" } else { &self.action_type });
        format!("The user approved the previous action. Please retry: {action}")
    }

    pub fn to_event(&self) -> TurnEvent {
        TurnEvent::PendingApproval {
            action_type: self.action_type.clone(),
            action_detail: self.action_detail.clone(),
        }
    }
}

pub fn is_affirmative(reply: &str) -> bool {
    let reply = reply.trim().to_lowercase();
    AFFIRMATIVE.contains(&reply.as_str())
}

/// Consume a pending approval: an affirmative reply lifts gating and turns the
/// prompt into a retry of the declined action. Anything else leaves both as-is.
pub fn resolve_pending(
    pending: Option<&PendingApproval>,
    prompt: &str,
    policy: ApprovalPolicy,
) -> (String, ApprovalPolicy) {
    match pending {
        Some(p) if is_affirmative(prompt) => (p.retry_prompt(), ApprovalPolicy::Never),
        _ => (prompt.to_string(), policy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_serde_is_kebab_case() {
        assert_eq!(serde_json::to_string(&ApprovalPolicy::OnRequest).unwrap(), r#""on-request""#);
        let p: ApprovalPolicy = serde_json::from_str(r#""untrusted""#).unwrap();
        assert_eq!(p, ApprovalPolicy::Untrusted);
        assert_eq!(ApprovalPolicy::OnFailure.as_str(), "on-failure");
    }

    #[test]
    fn only_never_skips_gating() {
        assert!(!ApprovalPolicy::Never.gates_commands());
        assert!(ApprovalPolicy::Untrusted.gates_commands());
        assert!(ApprovalPolicy::OnRequest.gates_commands());
    }

    #[test]
    fn affirmative_tokens() {
        for reply in ["yes", "Y", "  approve ", "YES\n"] {
            assert!(is_affirmative(reply), "{reply:?}");
        }
        for reply in ["no", "yes please", "", "ok"] {
            assert!(!is_affirmative(reply), "{reply:?}");
        }
    }

    #[test]
    fn approved_reply_retries_action_without_gating() {
        let pending = PendingApproval::new("requestApproval", "rm -rf build");
        let (prompt, policy) = resolve_pending(Some(&pending), "yes", ApprovalPolicy::Untrusted);
        assert_eq!(prompt, "The user approved the previous action. Please retry: rm -rf build");
        assert_eq!(policy, ApprovalPolicy::Never);
    }

    #[test]
    fn other_reply_keeps_prompt_and_policy() {
        let pending = PendingApproval::new("requestApproval", "rm -rf build");
        let (prompt, policy) = resolve_pending(Some(&pending), "no, list files", ApprovalPolicy::Untrusted);
        assert_eq!(prompt, "no, list files");
        assert_eq!(policy, ApprovalPolicy::Untrusted);
    }

    #[test]
    fn retry_prompt_falls_back_to_type() {
        let pending = PendingApproval { action_type: "applyPatch".into(), action_detail: None };
        assert!(pending.retry_prompt().ends_with("retry: applyPatch"));
        let pending = PendingApproval { action_type: String::new(), action_detail: None };
        assert!(pending.retry_prompt().ends_with("retry: the action"));
    }
}
