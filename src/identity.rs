//! Boundary with the identity provider.
//!
//! Sessions come back from the identity SDK in a handful of shapes. They are
//! normalized here, once, into a strict [`Principal`]; nothing past this
//! module looks at raw session data.

use serde_json::Value;

/// Signed-in user as seen by the sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
  pub id: String,
  /// Trimmed, lower-cased email; the merge key for every backend call
  pub email: String,
}

/// External collaborator exposing the current identity session.
pub trait IdentityProvider: Send + Sync {
  /// Raw session payload, or `None` when signed out.
  fn current_session(&self) -> Option<Value>;

  /// Current session normalized into a principal.
  fn current_principal(&self) -> Option<Principal> {
    self.current_session().as_ref().and_then(principal_from_session)
  }
}

/// Identity provider holding a fixed session, used by the command-line adapter.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
  session: Option<Value>,
}

impl StaticIdentity {
  pub fn new(session: Option<Value>) -> Self {
    Self { session }
  }

  /// Session for a bare email address.
  pub fn from_email(email: &str) -> Self {
    Self::new(Some(serde_json::json!({ "email": email })))
  }
}

impl IdentityProvider for StaticIdentity {
  fn current_session(&self) -> Option<Value> {
    self.session.clone()
  }
}

/// Normalize an email for use as a merge key.
pub fn normalize_email(email: &str) -> Option<String> {
  let email = email.trim().to_lowercase();
  if email.is_empty() || !email.contains('@') {
    return None;
  }
  Some(email)
}

/// Extract a principal from a raw session payload.
///
/// Accepted shapes:
/// - `{ "email": ..., "id": ... }`
/// - `{ "user": { "email" | "emailAddress": ..., "id" | "userId": ... } }`
/// - `{ "member": { "auth": { "email": ... }, "id": ... } }`
/// - `{ "data": <any of the above> }`
///
/// The id falls back to the normalized email when absent.
pub fn principal_from_session(session: &Value) -> Option<Principal> {
  if let Some(inner) = session.get("data").filter(|v| v.is_object()) {
    if let Some(principal) = principal_from_session(inner) {
      return Some(principal);
    }
  }

  let holder = ["user", "member"]
    .iter()
    .filter_map(|k| session.get(*k))
    .find(|v| v.is_object())
    .unwrap_or(session);

  let email = ["email", "emailAddress"]
    .iter()
    .filter_map(|k| holder.get(*k).and_then(Value::as_str))
    .next()
    .or_else(|| {
      holder
        .get("auth")
        .and_then(|a| a.get("email"))
        .and_then(Value::as_str)
    })
    .and_then(normalize_email)?;

  let id = ["id", "userId", "memberId"]
    .iter()
    .filter_map(|k| holder.get(*k))
    .find_map(|v| match v {
      Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
      Value::Number(n) => Some(n.to_string()),
      _ => None,
    })
    .unwrap_or_else(|| email.clone());

  Some(Principal { id, email })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_flat_session() {
    let p = principal_from_session(&json!({ "id": "u1", "email": " Jane@Example.COM " })).unwrap();
    assert_eq!(p.id, "u1");
    assert_eq!(p.email, "jane@example.com");
  }

  #[test]
  fn test_nested_shapes() {
    let user = json!({ "user": { "userId": 42, "emailAddress": "a@b.com" } });
    let member = json!({ "data": { "member": { "id": "mem_1", "auth": { "email": "C@D.com" } } } });

    let p = principal_from_session(&user).unwrap();
    assert_eq!((p.id.as_str(), p.email.as_str()), ("42", "a@b.com"));

    let p = principal_from_session(&member).unwrap();
    assert_eq!((p.id.as_str(), p.email.as_str()), ("mem_1", "c@d.com"));
  }

  #[test]
  fn test_missing_or_invalid_email_is_none() {
    assert_eq!(principal_from_session(&json!({ "id": "u1" })), None);
    assert_eq!(principal_from_session(&json!({ "email": "  " })), None);
    assert_eq!(principal_from_session(&json!(null)), None);
  }

  #[test]
  fn test_id_falls_back_to_email() {
    let identity = StaticIdentity::from_email("Ops@Example.com");
    let p = identity.current_principal().unwrap();
    assert_eq!(p.id, "ops@example.com");
    assert_eq!(StaticIdentity::new(None).current_principal(), None);
  }
}
