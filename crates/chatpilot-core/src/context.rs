//! Shared session view and the rules for updating it.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::intent::{Intent, SummaryTarget};

/// Consistent, owned copy of the shared session.
///
/// The hub hands these out to readers; the fallback controller keeps the last
/// one it saw and keeps mutating it locally while degraded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Known contact names, in directory order, without duplicates.
    #[serde(default)]
    pub contacts: Vec<String>,
    /// Most recently addressed contact.
    #[serde(default)]
    pub last_contact: Option<String>,
    /// Conversation the session is currently focused on.
    #[serde(default)]
    pub active_conversation: Option<String>,
    /// Whether automatic replies are on.
    #[serde(default)]
    pub auto_reply: bool,
}

/// Which parts of the session a mutation touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionChange {
    pub last_contact: bool,
    pub active_conversation: bool,
    pub auto_reply: bool,
    pub directory: bool,
}

impl SessionChange {
    /// True if nothing changed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !(self.last_contact || self.active_conversation || self.auto_reply || self.directory)
    }

    /// True if any non-directory field changed.
    #[must_use]
    pub const fn touches_session_fields(&self) -> bool {
        self.last_contact || self.active_conversation || self.auto_reply
    }
}

impl SessionSnapshot {
    /// Snapshot seeded with a directory.
    #[must_use]
    pub fn with_contacts<I, S>(contacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut snapshot = Self::default();
        snapshot.replace_directory(contacts);
        snapshot
    }

    /// Replace the directory wholesale.
    ///
    /// Names are trimmed, blanks dropped and case-insensitive duplicates
    /// collapsed onto their first occurrence. Returns true if the directory
    /// differs from before.
    pub fn replace_directory<I, S>(&mut self, contacts: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next: Vec<String> = Vec::new();
        for name in contacts {
            let name: String = name.into();
            let name = name.trim();
            if name.is_empty() || next.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                continue;
            }
            next.push(name.to_string());
        }
        if next == self.contacts {
            return false;
        }
        self.contacts = next;
        true
    }

    /// Copy of this snapshot with a client's own view layered on top.
    ///
    /// The client's directory only fills an empty one and its `last_contact`
    /// only fills a gap. Used for a single interpretation; never stored.
    #[must_use]
    pub fn with_client_context(&self, contacts: Option<&[String]>, last_contact: Option<&str>) -> Self {
        let mut view = self.clone();
        if let Some(contacts) = contacts {
            if view.contacts.is_empty() {
                view.replace_directory(contacts.iter().cloned());
            }
        }
        if view.last_contact.is_none() {
            view.last_contact = last_contact
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string);
        }
        view
    }

    /// Context passed to the language model alongside a raw command.
    #[must_use]
    pub fn context_snippet(&self, contact_limit: usize) -> Value {
        json!({
            "contact_list": self.contacts.iter().take(contact_limit).collect::<Vec<_>>(),
            "last_contact": self.last_contact,
            "active_conversation": self.active_conversation,
        })
    }

    /// Apply a successfully executed intent.
    ///
    /// `result` is the backend payload; `list_contacts` results carrying a
    /// `contacts` array replace the directory.
    pub fn apply_success(&mut self, intent: &Intent, result: &Value) -> SessionChange {
        let mut change = SessionChange::default();

        if let Some(contact) = intent.contact() {
            change.last_contact = self.set_last_contact(contact);
            change.active_conversation = self.set_active_conversation(contact);
        }

        match intent {
            Intent::Summarize {
                target: SummaryTarget::Conversation(id),
            } => {
                change.active_conversation = self.set_active_conversation(id);
            }
            Intent::SetAutoReply { enabled } => {
                change.auto_reply = self.auto_reply != *enabled;
                self.auto_reply = *enabled;
            }
            Intent::ListContacts => {
                if let Some(contacts) = result.get("contacts").and_then(Value::as_array) {
                    let names = contacts.iter().filter_map(Value::as_str).map(str::to_string);
                    change.directory = self.replace_directory(names);
                }
            }
            _ => {}
        }

        change
    }

    fn set_last_contact(&mut self, contact: &str) -> bool {
        if self.last_contact.as_deref() == Some(contact) {
            return false;
        }
        self.last_contact = Some(contact.to_string());
        true
    }

    fn set_active_conversation(&mut self, id: &str) -> bool {
        if self.active_conversation.as_deref() == Some(id) {
            return false;
        }
        self.active_conversation = Some(id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_directory_dedupes() {
        let mut snapshot = SessionSnapshot::default();
        assert!(snapshot.replace_directory(["John", " Sarah ", "john", "", "Mike"]));
        assert_eq!(snapshot.contacts, vec!["John", "Sarah", "Mike"]);
        assert!(!snapshot.replace_directory(["John", "Sarah", "Mike"]));
    }

    #[test]
    fn test_send_updates_last_contact() {
        let mut snapshot = SessionSnapshot::with_contacts(["Sarah"]);
        let intent = Intent::send("Sarah", "late").unwrap();
        let change = snapshot.apply_success(&intent, &Value::Null);
        assert!(change.last_contact);
        assert_eq!(snapshot.last_contact.as_deref(), Some("Sarah"));

        let change = snapshot.apply_success(&intent, &Value::Null);
        assert!(change.is_empty());
    }

    #[test]
    fn test_list_contacts_replaces_directory() {
        let mut snapshot = SessionSnapshot::with_contacts(["Old"]);
        let change = snapshot.apply_success(
            &Intent::ListContacts,
            &json!({ "contacts": ["John", "Emma"] }),
        );
        assert!(change.directory);
        assert!(!change.touches_session_fields());
        assert_eq!(snapshot.contacts, vec!["John", "Emma"]);
    }

    #[test]
    fn test_auto_reply_toggle() {
        let mut snapshot = SessionSnapshot::default();
        assert!(snapshot.apply_success(&Intent::set_auto_reply(true), &Value::Null).auto_reply);
        assert!(snapshot.auto_reply);
        assert!(snapshot.apply_success(&Intent::set_auto_reply(true), &Value::Null).is_empty());
    }

    #[test]
    fn test_client_context_only_fills_gaps() {
        let base = SessionSnapshot::default();
        let contacts = vec!["John".to_string(), "Sarah".to_string()];
        let view = base.with_client_context(Some(&contacts), Some(" John "));
        assert_eq!(view.contacts, vec!["John", "Sarah"]);
        assert_eq!(view.last_contact.as_deref(), Some("John"));
        assert_eq!(base, SessionSnapshot::default());

        let mut session = SessionSnapshot::with_contacts(["Mike"]);
        session.last_contact = Some("Mike".into());
        let view = session.with_client_context(Some(&contacts), Some("Sarah"));
        assert_eq!(view, session);
    }

    #[test]
    fn test_context_snippet_limits_contacts() {
        let mut snapshot = SessionSnapshot::with_contacts(["A", "B", "C"]);
        snapshot.last_contact = Some("B".into());
        let snippet = snapshot.context_snippet(2);
        assert_eq!(snippet["contact_list"], json!(["A", "B"]));
        assert_eq!(snippet["last_contact"], "B");
    }
}
