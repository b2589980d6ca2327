use serde_json::{Map, Value};

use super::Role;

/// Connection data may hold several JSON documents joined by this marker
/// (server-assigned data first, then what the client supplied).
const SEGMENT_SEPARATOR: &str = "%/%";

const NAME_KEYS: &[&str] = &["displayName", "display_name", "name", "userName", "nickname"];

/// What could be recovered from a connection's application payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub display_name: Option<String>,
    pub role: Option<Role>,
}

impl ConnectionMetadata {
    /// Never fails: unreadable segments are skipped.
    pub fn parse(raw: &str) -> Self {
        let mut metadata = Self::default();
        for segment in raw.split(SEGMENT_SEPARATOR) {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(segment) {
                Ok(value) => metadata.absorb(&value),
                Err(err) => tracing::debug!(
                    target = "consult::participants",
                    error = %err,
                    "ignoring unreadable connection metadata segment"
                ),
            }
        }
        metadata
    }

    fn absorb(&mut self, value: &Value) {
        let Value::Object(map) = value else {
            return;
        };
        if self.display_name.is_none() {
            self.display_name = first_name(map);
        }
        if self.role.is_none() {
            self.role = map.get("role").and_then(Value::as_str).and_then(Role::parse_loose);
        }
        match map.get("clientData") {
            Some(Value::String(inner)) => match serde_json::from_str::<Value>(inner) {
                Ok(nested) => self.absorb(&nested),
                Err(_) => {
                    let name = inner.trim();
                    if self.display_name.is_none() && !name.is_empty() {
                        self.display_name = Some(name.to_string());
                    }
                }
            },
            Some(nested @ Value::Object(_)) => self.absorb(nested),
            _ => {}
        }
    }

    /// Fills gaps from `other`, keeping what is already known.
    pub fn or(self, other: &ConnectionMetadata) -> Self {
        Self {
            display_name: self.display_name.or_else(|| other.display_name.clone()),
            role: self.role.or(other.role),
        }
    }

    /// Display name and role with the fallbacks applied.
    pub fn resolve(&self, local_role: Role, placeholder: &str) -> (String, Role) {
        (
            self.display_name
                .clone()
                .unwrap_or_else(|| placeholder.to_string()),
            self.role.unwrap_or_else(|| local_role.opposite()),
        )
    }
}

fn first_name(map: &Map<String, Value>) -> Option<String> {
    NAME_KEYS
        .iter()
        .filter_map(|key| map.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLACEHOLDER: &str = "참가자";

    #[test]
    fn malformed_payload_falls_back_to_placeholder_and_opposite_role() {
        let metadata = ConnectionMetadata::parse("{not json");
        assert_eq!(metadata, ConnectionMetadata::default());
        assert_eq!(
            metadata.resolve(Role::Advisor, PLACEHOLDER),
            (PLACEHOLDER.to_string(), Role::Client)
        );
        assert_eq!(
            ConnectionMetadata::parse("").resolve(Role::Client, PLACEHOLDER),
            (PLACEHOLDER.to_string(), Role::Advisor)
        );
    }

    #[test]
    fn reads_joined_server_and_client_segments() {
        let raw = r#"{"serverData":"x"}%/%{"clientData":"{\"displayName\":\"박상담\",\"role\":\"EXPERT\"}"}"#;
        let metadata = ConnectionMetadata::parse(raw);
        assert_eq!(metadata.display_name.as_deref(), Some("박상담"));
        assert_eq!(metadata.role, Some(Role::Advisor));
    }

    #[test]
    fn plain_client_data_is_a_name() {
        let metadata = ConnectionMetadata::parse(r#"{"clientData":"  김고객 ","role":"user"}"#);
        assert_eq!(metadata.display_name.as_deref(), Some("김고객"));
        assert_eq!(metadata.role, Some(Role::Client));
    }

    #[test]
    fn blank_names_and_unknown_roles_are_ignored() {
        let metadata = ConnectionMetadata::parse(r#"{"displayName":"  ","name":"Lee","role":"admin"}"#);
        assert_eq!(metadata.display_name.as_deref(), Some("Lee"));
        assert_eq!(metadata.role, None);
        assert_eq!(metadata.resolve(Role::Client, PLACEHOLDER).1, Role::Advisor);
    }

    #[test]
    fn gaps_are_filled_from_connection_metadata() {
        let from_stream = ConnectionMetadata {
            display_name: None,
            role: Some(Role::Client),
        };
        let from_connection = ConnectionMetadata {
            display_name: Some("Kim".into()),
            role: Some(Role::Advisor),
        };
        let merged = from_stream.or(&from_connection);
        assert_eq!(merged.display_name.as_deref(), Some("Kim"));
        assert_eq!(merged.role, Some(Role::Client));
    }
}
