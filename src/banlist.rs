//! Per-session ban list with JSON import/export.
//!
//! Bans are addressed by numeric entry id for removal. Ids are assigned
//! monotonically and never reused within a session lifetime, so an operator
//! acting on a stale listing can't unban the wrong entry.

use std::net::{IpAddr, Ipv4Addr};

use serde_json::{json, Value};

/// Who placed a ban, captured from the acting client at ban time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBanner {
    pub username: String,
    pub auth_id: String,
    pub ip: IpAddr,
    pub sid: String,
}

/// A single ban entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBan {
    pub id: i32,
    pub username: String,
    pub ip: IpAddr,
    pub ext_auth_id: String,
    pub sid: String,
    pub banned_by: String,
    pub banner: Option<SessionBanner>,
}

impl SessionBan {
    /// Identity key for duplicate detection.
    fn key(&self) -> (&str, IpAddr, &str, &str) {
        (&self.username, self.ip, &self.ext_auth_id, &self.sid)
    }
}

/// Ordered set of session bans.
#[derive(Debug, Default)]
pub struct BanList {
    bans: Vec<SessionBan>,
    next_id: i32,
}

impl BanList {
    pub fn new() -> Self {
        Self {
            bans: Vec::new(),
            next_id: 1,
        }
    }

    /// Add a ban. Returns the new positive entry id, or 0 if an entry with
    /// the same identity key already exists.
    pub fn add_ban(
        &mut self,
        username: &str,
        ip: IpAddr,
        ext_auth_id: &str,
        sid: &str,
        banned_by: &str,
        banner: Option<SessionBanner>,
    ) -> i32 {
        let candidate = SessionBan {
            id: 0,
            username: username.into(),
            ip,
            ext_auth_id: ext_auth_id.into(),
            sid: sid.into(),
            banned_by: banned_by.into(),
            banner,
        };
        if self.bans.iter().any(|b| b.key() == candidate.key()) {
            return 0;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.bans.push(SessionBan { id, ..candidate });
        id
    }

    /// Remove a ban by entry id, returning the banned username. Returns an
    /// empty string when the id is absent.
    pub fn remove_ban(&mut self, id: i32) -> String {
        match self.bans.iter().position(|b| b.id == id) {
            Some(pos) => self.bans.remove(pos).username,
            None => String::new(),
        }
    }

    pub fn get(&self, id: i32) -> Option<&SessionBan> {
        self.bans.iter().find(|b| b.id == id)
    }

    pub fn bans(&self) -> &[SessionBan] {
        &self.bans
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }

    /// Export as a JSON object for the `banimpex` reply family. Identifying
    /// fields (ip, external auth id, sid) are only included in `full` mode;
    /// the listing shown to session operators omits them.
    pub fn to_json(&self, full: bool) -> Value {
        let entries: Vec<Value> = self
            .bans
            .iter()
            .map(|b| {
                let mut entry = json!({
                    "id": b.id,
                    "username": b.username,
                    "bannedBy": b.banned_by,
                });
                if full {
                    entry["ip"] = json!(b.ip.to_string());
                    entry["extAuthId"] = json!(b.ext_auth_id);
                    entry["sid"] = json!(b.sid);
                }
                entry
            })
            .collect();
        json!({"bans": entries})
    }

    /// Parse a JSON ban export and feed each accepted entry to `each`.
    /// Accepts either the `{"bans": [...]}` export shape or a bare array.
    /// Returns false on structural error; entries that fail to parse are
    /// skipped without failing the import.
    pub fn import_bans(data: &Value, mut each: impl FnMut(SessionBan)) -> bool {
        let entries = match data {
            Value::Array(entries) => entries,
            Value::Object(obj) => match obj.get("bans").and_then(Value::as_array) {
                Some(entries) => entries,
                None => return false,
            },
            _ => return false,
        };
        for entry in entries {
            if let Some(ban) = Self::parse_entry(entry) {
                each(ban);
            }
        }
        true
    }

    fn parse_entry(entry: &Value) -> Option<SessionBan> {
        let obj = entry.as_object()?;
        let field = |key: &str| obj.get(key).and_then(Value::as_str).unwrap_or_default();
        let ip = field("ip").parse().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let ban = SessionBan {
            id: 0,
            username: field("username").into(),
            ip,
            ext_auth_id: field("extAuthId").into(),
            sid: field("sid").into(),
            banned_by: field("bannedBy").into(),
            banner: None,
        };
        // An entry that identifies nobody is useless
        if ban.username.is_empty() && ban.ext_auth_id.is_empty() && ban.sid.is_empty() {
            None
        } else {
            Some(ban)
        }
    }
}
