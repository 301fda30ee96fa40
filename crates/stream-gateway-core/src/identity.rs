//! Backend identity attributes of a session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity a session has learned so far.
///
/// Every attribute starts at its sentinel (`""` / `0`) and is filled in as
/// pushes reveal which backend account the session belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_name: String,
    pub uin: u64,
    pub qrcode_id: u64,
}

impl Identity {
    /// True while no attribute has been bound.
    #[must_use]
    pub fn is_unbound(&self) -> bool {
        self.qrcode_id == 0 && self.uin == 0 && self.user_name.is_empty()
    }

    /// Whether this identity answers to `key`.
    #[must_use]
    pub const fn matches(&self, key: IdentityKey) -> bool {
        match key {
            IdentityKey::Uin(uin) => self.uin == uin,
            IdentityKey::Qrcode(id) => self.qrcode_id == id,
        }
    }

    /// Merge `update` into this identity. Sentinel values in the update are ignored.
    ///
    /// Returns the keys that changed.
    pub fn apply(&mut self, update: &IdentityUpdate) -> Vec<IdentityKey> {
        let mut changed = Vec::new();
        if let Some(name) = update.user_name.as_deref().filter(|n| !n.is_empty()) {
            if self.user_name != name {
                self.user_name = name.to_string();
            }
        }
        if let Some(uin) = update.uin.filter(|u| *u != 0) {
            if self.uin != uin {
                self.uin = uin;
                changed.push(IdentityKey::Uin(uin));
            }
        }
        if let Some(id) = update.qrcode_id.filter(|q| *q != 0) {
            if self.qrcode_id != id {
                self.qrcode_id = id;
                changed.push(IdentityKey::Qrcode(id));
            }
        }
        changed
    }
}

/// Typed key a push can be routed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IdentityKey {
    Uin(u64),
    Qrcode(u64),
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uin(uin) => write!(f, "uin:{uin}"),
            Self::Qrcode(id) => write!(f, "qrcode:{id}"),
        }
    }
}

/// Identity attributes carried by a push payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityUpdate {
    pub user_name: Option<String>,
    pub uin: Option<u64>,
    pub qrcode_id: Option<u64>,
}

impl IdentityUpdate {
    /// Update binding only a QR code id.
    #[must_use]
    pub const fn qrcode(id: u64) -> Self {
        Self {
            user_name: None,
            uin: None,
            qrcode_id: Some(id),
        }
    }

    /// Update binding a uin.
    #[must_use]
    pub const fn uin(uin: u64) -> Self {
        Self {
            user_name: None,
            uin: Some(uin),
            qrcode_id: None,
        }
    }

    /// Extract `userName`, `uin` and `qrcodeId` from a JSON payload.
    ///
    /// Numeric fields are accepted as JSON numbers or decimal strings;
    /// zero and empty values are treated as absent.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Self {
        Self {
            user_name: payload
                .get("userName")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            uin: numeric_field(payload, "uin"),
            qrcode_id: numeric_field(payload, "qrcodeId"),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.user_name.is_none() && self.uin.is_none() && self.qrcode_id.is_none()
    }

    /// Preferred routing key: uin first, then QR code id.
    #[must_use]
    pub const fn routing_key(&self) -> Option<IdentityKey> {
        match (self.uin, self.qrcode_id) {
            (Some(uin), _) => Some(IdentityKey::Uin(uin)),
            (None, Some(id)) => Some(IdentityKey::Qrcode(id)),
            (None, None) => None,
        }
    }

    /// Every key this update could be routed by, most specific first.
    #[must_use]
    pub fn keys(&self) -> Vec<IdentityKey> {
        self.uin
            .map(IdentityKey::Uin)
            .into_iter()
            .chain(self.qrcode_id.map(IdentityKey::Qrcode))
            .collect()
    }
}

fn numeric_field(payload: &Value, field: &str) -> Option<u64> {
    match payload.get(field)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v| *v != 0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_default_identity_is_unbound() {
        let mut identity = Identity::default();
        assert!(identity.is_unbound());

        identity.apply(&IdentityUpdate::qrcode(7));
        assert!(!identity.is_unbound());
        assert!(identity.matches(IdentityKey::Qrcode(7)));
    }

    #[test]
    fn test_apply_ignores_sentinels() {
        let mut identity = Identity {
            user_name: "alice".into(),
            uin: 42,
            qrcode_id: 7,
        };
        let changed = identity.apply(&IdentityUpdate {
            user_name: Some(String::new()),
            uin: Some(0),
            qrcode_id: None,
        });
        assert!(changed.is_empty());
        assert_eq!(identity.uin, 42);
        assert_eq!(identity.user_name, "alice");
    }

    #[test]
    fn test_update_from_payload() {
        let update = IdentityUpdate::from_payload(&json!({
            "uin": "42",
            "qrcodeId": 7,
            "userName": "wxid_alice",
            "qrcode": "aGVsbG8="
        }));
        assert_eq!(update.uin, Some(42));
        assert_eq!(update.qrcode_id, Some(7));
        assert_eq!(update.user_name.as_deref(), Some("wxid_alice"));
        assert_eq!(update.routing_key(), Some(IdentityKey::Uin(42)));
        assert_eq!(
            update.keys(),
            vec![IdentityKey::Uin(42), IdentityKey::Qrcode(7)]
        );

        let empty = IdentityUpdate::from_payload(&json!({ "uin": 0, "text": "hi" }));
        assert!(empty.is_empty());
        assert_eq!(empty.routing_key(), None);
    }
}
