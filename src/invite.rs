//! Session invites with per-client usage tracking.
//!
//! An invite is a short secret token that grants entry (and optionally
//! operator or trusted status) to a limited number of distinct clients.
//! Usage is deduplicated by client key, so a reconnecting client does not
//! burn a second use.

use std::collections::HashMap;

use serde_json::{json, Value};

/// Cap on concurrently active invites per session.
pub const MAX_INVITES: usize = 20;

/// Cap on `max_uses` for a single invite.
pub const MAX_INVITE_USES: i32 = 50;

/// One recorded use of an invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteUse {
    /// Name the client presented at use time.
    pub name: String,
    /// ISO-8601 timestamp of first use.
    pub at: String,
}

impl InviteUse {
    /// JSON description of this use. The client key (`s`) identifies the
    /// client across renames and is only included when the caller supplies
    /// it, which it does for the full operator listing.
    pub fn to_json(&self, sid: &str) -> Value {
        let mut data = json!({"name": self.name, "at": self.at});
        if !sid.is_empty() {
            data["s"] = json!(sid);
        }
        data
    }
}

/// A session invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    pub secret: String,
    pub creator: String,
    /// ISO-8601 creation timestamp. String comparison preserves
    /// chronological order, which `remove_oldest_invite` relies on.
    pub at: String,
    pub max_uses: i32,
    pub trust: bool,
    pub op: bool,
    /// Uses keyed by client key.
    pub uses: HashMap<String, InviteUse>,
}

impl Invite {
    pub fn has_uses_remaining(&self) -> bool {
        (self.uses.len() as i32) < self.max_uses
    }

    pub fn to_json(&self, full: bool) -> Value {
        let mut data = json!({
            "secret": self.secret,
            "at": self.at,
            "maxUses": self.max_uses,
            "uses": self.uses_to_json(full),
        });
        if !self.creator.is_empty() {
            data["creator"] = json!(self.creator);
        }
        if self.op {
            data["op"] = json!(true);
        }
        if self.trust {
            data["trust"] = json!(true);
        }
        data
    }

    fn uses_to_json(&self, full: bool) -> Value {
        Value::Array(
            self.uses
                .iter()
                .map(|(key, invite_use)| invite_use.to_json(if full { key } else { "" }))
                .collect(),
        )
    }
}

/// Outcome of presenting an invite secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInviteResult {
    /// The client has no stable key to track usage by.
    NoClientKey,
    /// No invite with that secret.
    NotFound,
    /// This client already used the invite.
    AlreadyInvited,
    /// Already used, and the client's name was updated to the new one.
    AlreadyInvitedNameChanged,
    /// Dry-run probe: the invite would be accepted.
    InviteOk,
    /// The invite was accepted and a use was recorded.
    InviteUsed,
    /// All uses are taken.
    MaxUsesReached,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite(max_uses: i32) -> Invite {
        Invite {
            secret: "cafe01".into(),
            creator: "alice".into(),
            at: "2026-08-01T10:00:00Z".into(),
            max_uses,
            trust: false,
            op: true,
            uses: HashMap::new(),
        }
    }

    #[test]
    fn test_uses_remaining() {
        let mut inv = invite(2);
        assert!(inv.has_uses_remaining());
        inv.uses.insert(
            "k1".into(),
            InviteUse {
                name: "bob".into(),
                at: "2026-08-01T11:00:00Z".into(),
            },
        );
        assert!(inv.has_uses_remaining());
        inv.uses.insert(
            "k2".into(),
            InviteUse {
                name: "carol".into(),
                at: "2026-08-01T12:00:00Z".into(),
            },
        );
        assert!(!inv.has_uses_remaining());
    }

    #[test]
    fn test_invite_json_flags_omitted_when_false() {
        let mut inv = invite(3);
        inv.op = false;
        inv.creator.clear();
        let data = inv.to_json(false);
        assert!(data.get("op").is_none());
        assert!(data.get("trust").is_none());
        assert!(data.get("creator").is_none());
        assert_eq!(data["maxUses"], json!(3));
    }

    #[test]
    fn test_use_json_client_key_only_in_full_listing() {
        let mut inv = invite(3);
        inv.uses.insert(
            "key-1".into(),
            InviteUse {
                name: "bob".into(),
                at: "2026-08-01T11:00:00Z".into(),
            },
        );

        let redacted = inv.to_json(false);
        assert!(redacted["uses"][0].get("s").is_none());

        let full = inv.to_json(true);
        assert_eq!(full["uses"][0]["s"], json!("key-1"));
        assert_eq!(full["uses"][0]["name"], json!("bob"));
    }
}
