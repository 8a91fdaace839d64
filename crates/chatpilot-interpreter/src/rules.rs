//! Deterministic command parser.
//!
//! `RuleParser` implements [`LanguageModel`] with a fixed set of phrasings so a
//! client can keep working without the hosted model (degraded mode, demos,
//! tests). Its output goes through the same revalidation as any model's.

use std::sync::LazyLock;

use async_trait::async_trait;
use chatpilot_core::{IntentHint, LanguageModel, ModelError};
use regex::Regex;
use serde_json::Value;

static JSON_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("json object regex must compile"));

static AUTO_REPLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:(?:turn|switch|set)\s+)?(?:(on|off)\s+)?(?:the\s+)?auto[\s_-]?(?:repl(?:y|ies)|respon(?:se|der))?(?:\s+(on|off))?$",
    )
    .expect("auto reply regex must compile")
});

static LIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:(?:list|show)(?:\s+(?:my|all))?\s+(?:contacts|chats)|contacts|who\s+can\s+i\s+message)$")
        .expect("list regex must compile")
});

static SUGGEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:what\s+should\s+i\s+(?:reply|respond|say|answer)\s+to|suggest(?:\s+(?:a\s+)?(?:reply|replies|response))?\s+(?:for|to))\s+(.+)$",
    )
    .expect("suggest regex must compile")
});

static SUMMARY_CONVERSATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^summari[sz]e\s+conversation\s+#(\S+)$").expect("summary id regex must compile")
});

static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:summari[sz]e|summary\s+of|sum\s+up)(?:\s+(?:my|the))?(?:\s+(?:chat|conversation|messages))?(?:\s+(?:with|from|of))?\s+(.+)$",
    )
    .expect("summary regex must compile")
});

static READ_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:read|show|check)(?:\s+(?:my|the))?(?:\s+(?:messages|chat))?(?:\s+(?:from|with))?\s+(.+?)(?:'s)?(?:\s+(?:messages|chat))?$",
    )
    .expect("read regex must compile")
});

static SEND_DELIMITED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:send|message|text|tell|msg)\s+(.+?)\s*(?:\s+that|\s+saying|:)\s+(.+)$")
        .expect("send regex must compile")
});

static SEND_TO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^send\s+["'](.+)["']\s+to\s+(.+)$"#).expect("send-to regex must compile")
});

static SEND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:send|message|text|tell|msg)\s+(\S+)\s+(.+)$").expect("send regex must compile")
});

fn clean(s: &str) -> String {
    s.trim()
        .trim_end_matches(['?', '.', '!'])
        .trim_matches(['"', '\''])
        .trim()
        .to_string()
}

/// Pull the first JSON object out of free text and read it as a hint.
///
/// Models tend to wrap JSON in prose or code fences; anything outside the
/// outermost braces is ignored. Returns `None` if no object carries an action.
#[must_use]
pub fn extract_hint(text: &str) -> Option<IntentHint> {
    let candidate = JSON_OBJECT_RE.find(text)?.as_str();
    let hint: IntentHint = serde_json::from_str(candidate).ok()?;
    hint.action.is_some().then_some(hint)
}

fn parse_phrase(text: &str) -> IntentHint {
    let text = text.trim();

    if let Some(caps) = AUTO_REPLY_RE.captures(text) {
        let state = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_ascii_lowercase());
        if let Some(state) = state {
            return IntentHint::action("set_auto_reply").with_enabled(state == "on");
        }
    }

    if LIST_RE.is_match(text) {
        return IntentHint::action("list");
    }

    if let Some(caps) = SUGGEST_RE.captures(text) {
        return IntentHint::action("suggest").with_contact(clean(&caps[1]));
    }

    if let Some(caps) = SUMMARY_CONVERSATION_RE.captures(text) {
        return IntentHint::action("summary").with_conversation(clean(&caps[1]));
    }

    if let Some(caps) = SUMMARY_RE.captures(text) {
        return IntentHint::action("summary").with_contact(clean(&caps[1]));
    }

    if let Some(caps) = SEND_TO_RE.captures(text) {
        return IntentHint::action("send")
            .with_contact(clean(&caps[2]))
            .with_message(caps[1].trim());
    }

    for re in [&*SEND_DELIMITED_RE, &*SEND_RE] {
        if let Some(caps) = re.captures(text) {
            return IntentHint::action("send")
                .with_contact(clean(&caps[1]))
                .with_message(caps[2].trim());
        }
    }

    if let Some(caps) = READ_RE.captures(text) {
        return IntentHint::action("read").with_contact(clean(&caps[1]));
    }

    IntentHint::default()
}

fn conversation_lines(conversation: &str) -> Vec<&str> {
    conversation
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Rule-based language model.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleParser;

impl RuleParser {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LanguageModel for RuleParser {
    async fn parse_command(&self, text: &str, _context: &Value) -> Result<IntentHint, ModelError> {
        Ok(extract_hint(text).unwrap_or_else(|| parse_phrase(text)))
    }

    async fn summarize(&self, conversation: &str) -> Result<String, ModelError> {
        let lines = conversation_lines(conversation);
        let (Some(first), Some(last)) = (lines.first(), lines.last()) else {
            return Ok("No messages to summarize".to_string());
        };
        Ok(format!(
            "{} messages. Started with: {first}. Latest: {last}",
            lines.len()
        ))
    }

    async fn suggest_reply(&self, conversation: &str) -> Result<String, ModelError> {
        let lines = conversation_lines(conversation);
        let last = lines.last().map(|l| l.to_ascii_lowercase()).unwrap_or_default();
        let suggestions = if last.ends_with('?') {
            ["Yes, sounds good!", "Let me check and get back to you.", "Not sure yet, can we talk later?"]
        } else if last.contains("thank") {
            ["You're welcome!", "Anytime!", "Happy to help."]
        } else {
            ["Got it, thanks!", "Sounds good.", "Talk soon!"]
        };
        Ok(suggestions
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {s}", i + 1))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn generate(&self, _prompt: &str, _context: Option<&str>) -> Result<String, ModelError> {
        Err(ModelError::Unavailable(
            "rule parser does not generate free text".to_string(),
        ))
    }
}
