//! Hierarchical subjects and wildcard patterns.
//!
//! Subjects are dot-separated token paths, e.g.
//! `agent.msg.<exec_id>.<recipient_role>.<recipient_id>`. Patterns support
//! `*` (exactly one token) and a trailing `>` (one or more tokens).

use serde::{Deserialize, Serialize};

use squad_types::{AgentId, AgentRole, BroadcastScope, ConversationId, ExecutionId};

/// A concrete, fully-specified subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    /// Parse a concrete subject, rejecting empty tokens and wildcards.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Err("subject cannot be empty".to_string());
        }
        for token in raw.split('.') {
            if token.is_empty() {
                return Err(format!("subject has an empty token: {raw}"));
            }
            if token == "*" || token == ">" {
                return Err(format!("concrete subject may not contain wildcards: {raw}"));
            }
        }
        Ok(Self(raw.to_string()))
    }

    /// The subject as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The dot-separated tokens of the subject.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One token of a subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    Literal(String),
    /// `*` - matches exactly one token.
    Single,
    /// `>` - matches one or more trailing tokens; only valid in last position.
    Tail,
}

/// A subscription pattern over subjects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPattern {
    tokens: Vec<PatternToken>,
    raw: String,
}

impl SubjectPattern {
    /// Parse a pattern, validating wildcard placement.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Err("pattern cannot be empty".to_string());
        }
        let parts: Vec<&str> = raw.split('.').collect();
        let mut tokens = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            match *part {
                "" => return Err(format!("pattern has an empty token: {raw}")),
                "*" => tokens.push(PatternToken::Single),
                ">" => {
                    if i != parts.len() - 1 {
                        return Err(format!("'>' is only valid as the last token: {raw}"));
                    }
                    tokens.push(PatternToken::Tail);
                }
                literal => {
                    if literal.contains('*') || literal.contains('>') {
                        return Err(format!("wildcard inside a token: {raw}"));
                    }
                    tokens.push(PatternToken::Literal(literal.to_string()));
                }
            }
        }
        Ok(Self {
            tokens,
            raw: raw.to_string(),
        })
    }

    /// Whether the pattern matches the given concrete subject.
    pub fn matches(&self, subject: &Subject) -> bool {
        let subject_tokens: Vec<&str> = subject.tokens().collect();
        let mut si = 0;
        for (pi, token) in self.tokens.iter().enumerate() {
            match token {
                PatternToken::Tail => {
                    // `>` needs at least one remaining subject token.
                    debug_assert_eq!(pi, self.tokens.len() - 1);
                    return si < subject_tokens.len();
                }
                PatternToken::Single => {
                    if si >= subject_tokens.len() {
                        return false;
                    }
                    si += 1;
                }
                PatternToken::Literal(expected) => {
                    if subject_tokens.get(si) != Some(&expected.as_str()) {
                        return false;
                    }
                    si += 1;
                }
            }
        }
        si == subject_tokens.len()
    }

    /// The pattern as originally written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

//─────────────────────────────
//  Well-known subject builders
//─────────────────────────────

/// Point-to-point inbox subject:
/// `agent.msg.{execution_id}.{recipient_role}.{recipient_id}`.
pub fn agent_inbox(execution_id: ExecutionId, role: AgentRole, agent_id: AgentId) -> Subject {
    Subject(format!("agent.msg.{execution_id}.{role}.{agent_id}"))
}

/// Fanout subject: `agent.msg.{execution_id}.broadcast.{scope}`.
pub fn broadcast(execution_id: ExecutionId, scope: BroadcastScope) -> Subject {
    Subject(format!("agent.msg.{execution_id}.broadcast.{}", scope.as_token()))
}

/// Conversation lifecycle subject: `conv.{execution_id}.{conversation_id}`.
pub fn conversation(execution_id: ExecutionId, conversation_id: ConversationId) -> Subject {
    Subject(format!("conv.{execution_id}.{conversation_id}"))
}

/// Workflow transition subject: `state.{execution_id}`.
pub fn state(execution_id: ExecutionId) -> Subject {
    Subject(format!("state.{execution_id}"))
}

/// Pattern matching an agent's inbox regardless of role dispatch:
/// `agent.msg.{execution_id}.*.{agent_id}`.
pub fn inbox_pattern(execution_id: ExecutionId, agent_id: AgentId) -> SubjectPattern {
    SubjectPattern::parse(&format!("agent.msg.{execution_id}.*.{agent_id}"))
        .expect("inbox pattern is well-formed")
}

/// Pattern matching a single broadcast scope of an execution.
pub fn broadcast_pattern(execution_id: ExecutionId, scope: BroadcastScope) -> SubjectPattern {
    SubjectPattern::parse(&format!(
        "agent.msg.{execution_id}.broadcast.{}",
        scope.as_token()
    ))
    .expect("broadcast pattern is well-formed")
}

/// Pattern matching every agent message of an execution.
pub fn execution_messages(execution_id: ExecutionId) -> SubjectPattern {
    SubjectPattern::parse(&format!("agent.msg.{execution_id}.>"))
        .expect("execution pattern is well-formed")
}

/// Pattern matching every agent message on the bus.
pub fn all_messages() -> SubjectPattern {
    SubjectPattern::parse("agent.msg.>").expect("static pattern is well-formed")
}

/// Pattern matching every conversation notice on the bus.
pub fn all_conversations() -> SubjectPattern {
    SubjectPattern::parse("conv.>").expect("static pattern is well-formed")
}

/// Pattern matching conversation notices of one execution.
pub fn execution_conversations(execution_id: ExecutionId) -> SubjectPattern {
    SubjectPattern::parse(&format!("conv.{execution_id}.>"))
        .expect("conversation pattern is well-formed")
}

/// Pattern matching every workflow transition on the bus.
pub fn all_state_changes() -> SubjectPattern {
    SubjectPattern::parse("state.>").expect("static pattern is well-formed")
}

/// Pattern matching workflow transitions of one execution.
pub fn execution_state_changes(execution_id: ExecutionId) -> SubjectPattern {
    SubjectPattern::parse(&format!("state.{execution_id}")).expect("state pattern is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn concrete_subject_rejects_wildcards() {
        assert!(Subject::parse("agent.msg.*.x").is_err());
        assert!(Subject::parse("agent.msg.>").is_err());
        assert!(Subject::parse("agent..msg").is_err());
        assert!(Subject::parse("").is_err());
        assert!(Subject::parse("agent.msg.abc").is_ok());
    }

    #[test]
    fn tail_only_valid_last() {
        assert!(SubjectPattern::parse("agent.>.msg").is_err());
        assert!(SubjectPattern::parse("agent.msg.>").is_ok());
    }

    #[test]
    fn single_token_wildcard_matches_one_token() {
        let pattern = SubjectPattern::parse("agent.msg.e1.*.a9").unwrap();
        assert!(pattern.matches(&Subject::parse("agent.msg.e1.tech_lead.a9").unwrap()));
        assert!(!pattern.matches(&Subject::parse("agent.msg.e1.a9").unwrap()));
        assert!(!pattern.matches(&Subject::parse("agent.msg.e1.x.y.a9").unwrap()));
        assert!(!pattern.matches(&Subject::parse("agent.msg.e2.tech_lead.a9").unwrap()));
    }

    #[test]
    fn tail_wildcard_requires_at_least_one_token() {
        let pattern = SubjectPattern::parse("agent.msg.>").unwrap();
        assert!(pattern.matches(&Subject::parse("agent.msg.e1").unwrap()));
        assert!(pattern.matches(&Subject::parse("agent.msg.e1.role.a2").unwrap()));
        assert!(!pattern.matches(&Subject::parse("agent.msg").unwrap()));
    }

    #[test]
    fn exact_pattern_is_exact() {
        let exec = ExecutionId::new();
        let pattern = execution_state_changes(exec);
        assert!(pattern.matches(&state(exec)));
        assert!(!pattern.matches(&state(ExecutionId::new())));
    }

    #[test]
    fn inbox_pattern_catches_any_role_dispatch() {
        let exec = ExecutionId::new();
        let me = AgentId::new();
        let pattern = inbox_pattern(exec, me);
        for role in AgentRole::ALL {
            assert!(pattern.matches(&agent_inbox(exec, role, me)));
        }
        assert!(!pattern.matches(&agent_inbox(exec, AgentRole::TechLead, AgentId::new())));
    }

    proptest! {
        #[test]
        fn literal_patterns_match_only_themselves(tokens in prop::collection::vec("[a-z0-9_]{1,8}", 1..6)) {
            let raw = tokens.join(".");
            let subject = Subject::parse(&raw).unwrap();
            let pattern = SubjectPattern::parse(&raw).unwrap();
            prop_assert!(pattern.matches(&subject));

            let longer = Subject::parse(&format!("{raw}.tail")).unwrap();
            prop_assert!(!pattern.matches(&longer));
        }

        #[test]
        fn tail_matches_any_extension(tokens in prop::collection::vec("[a-z0-9_]{1,8}", 1..5),
                                      ext in prop::collection::vec("[a-z0-9_]{1,8}", 1..4)) {
            let base = tokens.join(".");
            let pattern = SubjectPattern::parse(&format!("{base}.>")).unwrap();
            let subject = Subject::parse(&format!("{base}.{}", ext.join("."))).unwrap();
            prop_assert!(pattern.matches(&subject));
            prop_assert!(!pattern.matches(&Subject::parse(&base).unwrap()));
        }
    }
}
