// models.rs
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::PollStatus;

/// Option text -> vote count.
pub type Tally = BTreeMap<String, u64>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub options: Vec<String>,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_closed: bool,
}

impl Poll {
    /// The stored spelling of the option matching `text` case-insensitively.
    pub fn canonical_option(&self, text: &str) -> Option<&str> {
        let wanted = text.trim().to_lowercase();
        self.options
            .iter()
            .find(|o| o.to_lowercase() == wanted)
            .map(String::as_str)
    }
}

/// A poll as returned to callers, with its derived status and, when asked
/// for, its tally.
#[derive(Debug, Clone, Serialize)]
pub struct PollView {
    #[serde(flatten)]
    pub poll: Poll,
    pub status: PollStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub votes: Option<Tally>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePollRequest {
    pub question: String,
    pub options: Vec<String>,
    /// Minutes until the poll stops accepting votes.
    pub expires_in: u32,
}

#[derive(Debug, Serialize)]
pub struct CreatePollResponse {
    pub poll_id: String,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub option: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct SearchFilter {
    pub created_by: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub is_closed: Option<bool>,
}

impl SearchFilter {
    pub fn matches(&self, poll: &Poll) -> bool {
        if let Some(creator) = &self.created_by {
            if &poll.created_by != creator {
                return false;
            }
        }
        if let Some(from) = self.from_date {
            if poll.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to_date {
            if poll.created_at > to {
                return false;
            }
        }
        if let Some(closed) = self.is_closed {
            if poll.is_closed != closed {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetPollQuery {
    #[serde(default)]
    pub with_votes: bool,
}

#[derive(Debug, Serialize)]
pub struct TallyResponse {
    pub poll: PollView,
    pub votes: Tally,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn poll(created_by: &str, is_closed: bool, created_at: DateTime<Utc>) -> Poll {
        Poll {
            id: "p".into(),
            question: "q".into(),
            options: vec!["Cat".into(), "Dog".into()],
            created_by: created_by.into(),
            updated_by: created_by.into(),
            created_at,
            expires_at: created_at + Duration::minutes(5),
            is_closed,
        }
    }

    #[test]
    fn canonical_option_ignores_case_and_padding() {
        let p = poll("u1", false, Utc::now());
        assert_eq!(p.canonical_option("dog"), Some("Dog"));
        assert_eq!(p.canonical_option("  CAT "), Some("Cat"));
        assert_eq!(p.canonical_option("Fish"), None);
    }

    #[test]
    fn search_filter_combines_all_criteria() {
        let now = Utc::now();
        let p = poll("u1", true, now);

        assert!(SearchFilter::default().matches(&p));
        assert!(SearchFilter {
            created_by: Some("u1".into()),
            from_date: Some(now - Duration::hours(1)),
            to_date: Some(now + Duration::hours(1)),
            is_closed: Some(true),
        }
        .matches(&p));
        assert!(!SearchFilter {
            created_by: Some("u2".into()),
            ..Default::default()
        }
        .matches(&p));
        assert!(!SearchFilter {
            from_date: Some(now + Duration::seconds(1)),
            ..Default::default()
        }
        .matches(&p));
        assert!(!SearchFilter {
            is_closed: Some(false),
            ..Default::default()
        }
        .matches(&p));
    }
}
