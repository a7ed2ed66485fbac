//! Poll lifecycle.
//!
//! A poll's status is never stored. It is derived from the `is_closed` flag
//! and `expires_at` every time it is needed:
//!
//! ```text
//!            close (admin)
//!   Open ------------------> Closed
//!     |
//!     | now >= expires_at
//!     v
//!   Expired
//! ```
//!
//! `Closed` wins over `Expired` when both apply. Neither leads back to
//! `Open`, and only `Open` accepts votes.
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;
use crate::models::Poll;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Open,
    Closed,
    Expired,
}

impl PollStatus {
    pub fn accepts_votes(self) -> bool {
        self == PollStatus::Open
    }
}

impl Poll {
    pub fn status_at(&self, now: DateTime<Utc>) -> PollStatus {
        if self.is_closed {
            PollStatus::Closed
        } else if now >= self.expires_at {
            PollStatus::Expired
        } else {
            PollStatus::Open
        }
    }

    pub fn status(&self) -> PollStatus {
        self.status_at(Utc::now())
    }
}

/// Rejects anything but an open poll with `Forbidden`.
pub fn ensure_open(poll: &Poll, now: DateTime<Utc>) -> Result<(), AppError> {
    match poll.status_at(now) {
        PollStatus::Open => Ok(()),
        PollStatus::Closed => Err(AppError::Forbidden(format!("Poll {} is closed", poll.id))),
        PollStatus::Expired => Err(AppError::Forbidden(format!("Poll {} has expired", poll.id))),
    }
}
