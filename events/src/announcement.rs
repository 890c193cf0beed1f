use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An admin announcement fanned out to every connected client.
///
/// `id` is `0` when the producer did not assign one (e.g. a payload relayed
/// from an upstream stream that omitted it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: u64,
    pub author: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Announcement {
    pub fn new(
        id: u64,
        author: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            author: author.into(),
            title: title.into(),
            content: content.into(),
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_announcement_serializes_with_camel_case_keys() {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let announcement = Announcement::new(7, "alice", "Hi", "Hello|World", created_at);

        let json = serde_json::to_value(&announcement).unwrap();

        assert_eq!(json["id"], 7);
        assert_eq!(json["author"], "alice");
        assert_eq!(json["createdAt"], "2024-01-01T00:00:00Z");
        assert!(json.get("created_at").is_none());
    }

    #[test]
    fn test_announcement_deserializes_from_api_payload() {
        let payload = r#"{"id":3,"author":"bob","title":"T","content":"C","createdAt":"2024-05-06T07:08:09Z"}"#;

        let announcement: Announcement = serde_json::from_str(payload).unwrap();

        assert_eq!(announcement.id, 3);
        assert_eq!(announcement.author, "bob");
        assert_eq!(
            announcement.created_at,
            Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()
        );
    }
}
