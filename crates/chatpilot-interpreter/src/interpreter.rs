//! Raw command + session snapshot to validated intent.

use std::{sync::Arc, time::Duration};

use chatpilot_core::{
    ErrorKind, HubConfig, Intent, IntentError, IntentHint, LanguageModel, MatchPolicy, ModelError,
    SessionSnapshot,
};
use thiserror::Error;

use crate::{
    fuzzy::{ContactMatcher, MatchError, normalize},
    reference::{ContactRef, classify, is_pronoun, mentions_pronoun},
};

const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONTEXT_LIMIT: usize = 20;

/// Interpretation error.
#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("Ambiguous reference: {0}")]
    AmbiguousReference(String),
    #[error("Unresolved contact: {0}")]
    UnresolvedContact(String),
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),
    #[error("Language model timed out after {0:?}")]
    ModelTimeout(Duration),
    #[error("Language model error: {0}")]
    Model(#[from] ModelError),
}

impl InterpretError {
    /// Wire classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AmbiguousReference(_) => ErrorKind::AmbiguousReference,
            Self::UnresolvedContact(_) => ErrorKind::UnresolvedContact,
            Self::UnsupportedCommand(_) => ErrorKind::UnsupportedCommand,
            Self::ModelTimeout(_) => ErrorKind::DispatchTimeout,
            Self::Model(_) => ErrorKind::BackendFailure,
        }
    }
}

impl From<MatchError> for InterpretError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::Ambiguous { .. } => Self::AmbiguousReference(e.to_string()),
            MatchError::Unresolved { .. } => Self::UnresolvedContact(e.to_string()),
        }
    }
}

impl From<IntentError> for InterpretError {
    fn from(e: IntentError) -> Self {
        Self::UnsupportedCommand(e.to_string())
    }
}

/// Normalized action name from a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Send,
    Read,
    Summarize,
    SuggestReply,
    AutoReply(Option<bool>),
    ListContacts,
}

impl Action {
    fn parse(raw: &str) -> Option<Self> {
        let key = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let action = match key.as_str() {
            "send" | "send_message" | "message" | "tell" | "text" | "msg" => Self::Send,
            "read" | "read_messages" | "get_messages" | "messages" | "show" => Self::Read,
            "summary" | "summarize" | "summarise" | "get_summary" => Self::Summarize,
            "suggest" | "suggest_reply" | "suggestions" | "reply_suggestion" => Self::SuggestReply,
            "auto_on" | "auto_reply_on" | "enable_auto_reply" => Self::AutoReply(Some(true)),
            "auto_off" | "auto_reply_off" | "disable_auto_reply" => Self::AutoReply(Some(false)),
            "set_auto_reply" | "auto_reply" | "auto" => Self::AutoReply(None),
            "list" | "list_contacts" | "contacts" => Self::ListContacts,
            _ => return None,
        };
        Some(action)
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Read => "read",
            Self::Summarize => "summarize",
            Self::SuggestReply => "suggest_reply",
            Self::AutoReply(_) => "set_auto_reply",
            Self::ListContacts => "list_contacts",
        }
    }
}

/// Command interpreter.
///
/// Reads the session through snapshots only; it never mutates shared state.
#[derive(Clone)]
pub struct Interpreter {
    model: Arc<dyn LanguageModel>,
    matcher: ContactMatcher,
    model_timeout: Duration,
    context_limit: usize,
}

impl Interpreter {
    /// Create an interpreter over a language model.
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>, policy: MatchPolicy) -> Self {
        Self {
            model,
            matcher: ContactMatcher::new(policy),
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            context_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }

    /// Create an interpreter from hub configuration.
    #[must_use]
    pub fn from_config(model: Arc<dyn LanguageModel>, config: &HubConfig) -> Self {
        Self::new(model, config.matching)
            .with_model_timeout(config.model_timeout())
            .with_context_limit(config.context_contact_limit)
    }

    /// Bound every model call.
    #[must_use]
    pub const fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    /// Number of contacts included in the model context.
    #[must_use]
    pub const fn with_context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    /// Language model in use.
    #[must_use]
    pub fn model(&self) -> Arc<dyn LanguageModel> {
        Arc::clone(&self.model)
    }

    /// Interpret a raw natural-language command.
    ///
    /// # Errors
    /// Returns error if the command cannot be turned into a complete intent.
    pub async fn interpret(&self, raw: &str, ctx: &SessionSnapshot) -> Result<Intent, InterpretError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(InterpretError::UnsupportedCommand("empty command".into()));
        }

        let snippet = ctx.context_snippet(self.context_limit);
        let hint = tokio::time::timeout(self.model_timeout, self.model.parse_command(raw, &snippet))
            .await
            .map_err(|_| InterpretError::ModelTimeout(self.model_timeout))??;

        tracing::debug!(command = raw, ?hint, "Model hint");
        self.build(&hint, Some(raw), ctx)
    }

    /// Build an intent from a structured hint (e.g. a `direct_command`).
    ///
    /// # Errors
    /// Returns error if the hint is incomplete or names no known contact.
    pub fn build_intent(&self, hint: &IntentHint, ctx: &SessionSnapshot) -> Result<Intent, InterpretError> {
        self.build(hint, None, ctx)
    }

    fn build(
        &self,
        hint: &IntentHint,
        raw: Option<&str>,
        ctx: &SessionSnapshot,
    ) -> Result<Intent, InterpretError> {
        let action = hint
            .action
            .as_deref()
            .ok_or_else(|| InterpretError::UnsupportedCommand("no action recognised".into()))?;
        let action = Action::parse(action)
            .ok_or_else(|| InterpretError::UnsupportedCommand(format!("unknown action '{action}'")))?;

        let intent = match action {
            Action::Send => {
                let message = hint
                    .message
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .ok_or_else(|| InterpretError::UnsupportedCommand("send requires a message".into()))?;
                let contact = self.resolve_contact(hint.contact.as_deref(), raw, ctx, action)?;
                Intent::send(contact, message)?
            }
            Action::Read => Intent::read(self.resolve_contact(hint.contact.as_deref(), raw, ctx, action)?)?,
            Action::SuggestReply => {
                Intent::suggest_reply(self.resolve_contact(hint.contact.as_deref(), raw, ctx, action)?)?
            }
            Action::Summarize => match hint.conversation.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => Intent::summarize_conversation(id)?,
                _ => Intent::summarize_contact(
                    self.resolve_contact(hint.contact.as_deref(), raw, ctx, action)?,
                )?,
            },
            Action::AutoReply(fixed) => {
                let enabled = fixed.or(hint.enabled).ok_or_else(|| {
                    InterpretError::UnsupportedCommand("auto-reply needs on or off".into())
                })?;
                Intent::set_auto_reply(enabled)
            }
            Action::ListContacts => Intent::ListContacts,
        };

        Ok(intent)
    }

    /// Pin a hinted contact to one directory entry.
    fn resolve_contact(
        &self,
        hinted: Option<&str>,
        raw: Option<&str>,
        ctx: &SessionSnapshot,
        action: Action,
    ) -> Result<String, InterpretError> {
        let mut reference = classify(hinted);

        // A model may quietly swap a pronoun for a name it guessed from context.
        // If the name is not written in the command, resolve the pronoun ourselves.
        if let (ContactRef::Named(name), Some(raw)) = (reference, raw) {
            if mentions_pronoun(raw) && !self.is_written_in(name, raw, &ctx.contacts) {
                tracing::debug!(name, "Ignoring model-substituted contact for pronoun");
                reference = ContactRef::Implicit;
            }
        }

        match reference {
            ContactRef::Implicit => ctx.last_contact.clone().ok_or_else(|| {
                InterpretError::AmbiguousReference(format!(
                    "{} needs a contact and no one was addressed earlier",
                    action.name()
                ))
            }),
            ContactRef::Named(name) => Ok(self.matcher.resolve(name, &ctx.contacts)?.to_string()),
        }
    }

    /// True if `raw` spells `name` out, or has a word resolving to the same entry.
    ///
    /// Models canonicalize misspellings ("jon" becomes "John"), so a plain
    /// substring check is not enough.
    fn is_written_in(&self, name: &str, raw: &str, directory: &[String]) -> bool {
        let raw = normalize(raw);
        if raw.contains(&normalize(name)) {
            return true;
        }
        let Ok(entry) = self.matcher.resolve(name, directory) else {
            return false;
        };
        raw.split(' ')
            .filter(|word| !is_pronoun(word))
            .any(|word| self.matcher.resolve(word, directory).is_ok_and(|found| found == entry))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chatpilot_core::SummaryTarget;
    use serde_json::Value;

    use super::*;
    use crate::rules::RuleParser;

    fn snapshot(last: Option<&str>) -> SessionSnapshot {
        let mut ctx = SessionSnapshot::with_contacts(["John", "Sarah", "Mike"]);
        ctx.last_contact = last.map(Into::into);
        ctx
    }

    fn interpreter() -> Interpreter {
        Interpreter::new(Arc::new(RuleParser), MatchPolicy::default())
    }

    /// Model that always answers with the same hint.
    struct FixedModel(IntentHint);

    #[async_trait]
    impl LanguageModel for FixedModel {
        async fn parse_command(&self, _text: &str, _context: &Value) -> Result<IntentHint, ModelError> {
            Ok(self.0.clone())
        }
        async fn summarize(&self, _conversation: &str) -> Result<String, ModelError> {
            Ok(String::new())
        }
        async fn suggest_reply(&self, _conversation: &str) -> Result<String, ModelError> {
            Ok(String::new())
        }
        async fn generate(&self, _prompt: &str, _context: Option<&str>) -> Result<String, ModelError> {
            Ok(String::new())
        }
    }

    /// Model that never answers.
    struct StalledModel;

    #[async_trait]
    impl LanguageModel for StalledModel {
        async fn parse_command(&self, _text: &str, _context: &Value) -> Result<IntentHint, ModelError> {
            std::future::pending().await
        }
        async fn summarize(&self, _conversation: &str) -> Result<String, ModelError> {
            std::future::pending().await
        }
        async fn suggest_reply(&self, _conversation: &str) -> Result<String, ModelError> {
            std::future::pending().await
        }
        async fn generate(&self, _prompt: &str, _context: Option<&str>) -> Result<String, ModelError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_pronoun_uses_last_contact() {
        let intent = interpreter()
            .interpret("tell her I'm late", &snapshot(Some("Sarah")))
            .await
            .unwrap();
        assert_eq!(intent, Intent::send("Sarah", "I'm late").unwrap());
    }

    #[tokio::test]
    async fn test_pronoun_without_last_contact_is_ambiguous() {
        let err = interpreter()
            .interpret("tell her I'm late", &snapshot(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AmbiguousReference);
    }

    #[tokio::test]
    async fn test_fuzzy_contact_in_command() {
        let intent = interpreter()
            .interpret("read jon's messages", &snapshot(None))
            .await
            .unwrap();
        assert_eq!(intent, Intent::read("John").unwrap());

        let err = interpreter()
            .interpret("read Zzzzz's messages", &snapshot(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnresolvedContact);
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let err = interpreter()
            .interpret("make me a sandwich", &snapshot(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedCommand);

        let err = interpreter().interpret("   ", &snapshot(None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedCommand);
    }

    #[tokio::test]
    async fn test_model_output_is_revalidated() {
        // Model claims a contact outside the directory.
        let model = FixedModel(IntentHint::action("send").with_contact("Zed").with_message("hi"));
        let interpreter = Interpreter::new(Arc::new(model), MatchPolicy::default());
        let err = interpreter.interpret("send zed hi", &snapshot(None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnresolvedContact);

        // Model substitutes a name for a pronoun it could not know about.
        let model = FixedModel(IntentHint::action("send").with_contact("Mike").with_message("late"));
        let interpreter = Interpreter::new(Arc::new(model), MatchPolicy::default());
        let intent = interpreter
            .interpret("tell her I'm late", &snapshot(Some("Sarah")))
            .await
            .unwrap();
        assert_eq!(intent.contact(), Some("Sarah"));

        // Send without a body is rejected, not forwarded.
        let model = FixedModel(IntentHint::action("send").with_contact("John"));
        let interpreter = Interpreter::new(Arc::new(model), MatchPolicy::default());
        let err = interpreter.interpret("send john", &snapshot(None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedCommand);
    }

    #[tokio::test]
    async fn test_canonicalized_name_keeps_pronoun_in_body() {
        // The model corrected "jon"; "her" belongs to the message.
        let model = FixedModel(
            IntentHint::action("send")
                .with_contact("John")
                .with_message("her flight is late"),
        );
        let interpreter = Interpreter::new(Arc::new(model), MatchPolicy::default());
        let intent = interpreter
            .interpret("tell jon her flight is late", &snapshot(Some("Sarah")))
            .await
            .unwrap();
        assert_eq!(intent, Intent::send("John", "her flight is late").unwrap());
    }

    #[tokio::test]
    async fn test_model_timeout() {
        let interpreter = Interpreter::new(Arc::new(StalledModel), MatchPolicy::default())
            .with_model_timeout(Duration::from_millis(20));
        let err = interpreter.interpret("read john", &snapshot(None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DispatchTimeout);
    }

    #[test]
    fn test_build_intent_from_structured_action() {
        let interpreter = interpreter();
        let ctx = snapshot(Some("Mike"));

        let intent = interpreter
            .build_intent(&IntentHint::action("auto_on"), &ctx)
            .unwrap();
        assert_eq!(intent, Intent::set_auto_reply(true));

        let intent = interpreter
            .build_intent(&IntentHint::action("summary"), &ctx)
            .unwrap();
        assert_eq!(
            intent,
            Intent::Summarize {
                target: SummaryTarget::Contact("Mike".into())
            }
        );

        let intent = interpreter
            .build_intent(&IntentHint::action("summary").with_conversation("c-1"), &ctx)
            .unwrap();
        assert_eq!(intent, Intent::summarize_conversation("c-1").unwrap());

        let err = interpreter
            .build_intent(&IntentHint::action("set_auto_reply"), &ctx)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedCommand);

        let err = interpreter
            .build_intent(&IntentHint::action("dance"), &ctx)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedCommand);
    }
}
