// src/vote.rs
use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{AppError, StoreError};
use crate::lifecycle::ensure_open;
use crate::models::{PollView, Tally};
use crate::poll::PollRepository;
use crate::store::{keys, BatchOp, KvStore};

pub struct VoteLedger {
    store: Arc<dyn KvStore>,
    polls: Arc<PollRepository>,
}

impl VoteLedger {
    pub fn new(store: Arc<dyn KvStore>, polls: Arc<PollRepository>) -> Self {
        Self { store, polls }
    }

    /// Records one vote of `voter` on `poll_id`.
    ///
    /// The membership check up front only turns away obvious repeats early.
    /// The voter set insertion inside the conditional batch is what actually
    /// enforces one vote per identity: the tally and the voter's log entry
    /// are written only if that insertion was new, so two racing requests
    /// from the same identity cannot both count.
    pub async fn cast_vote(&self, poll_id: &str, voter: &str, option: &str) -> Result<(), AppError> {
        if voter.is_empty() {
            return Err(AppError::Validation("Voter identity is required".into()));
        }

        let poll = self.polls.get(poll_id).await?;
        ensure_open(&poll, Utc::now())?;

        let canonical = poll
            .canonical_option(option)
            .ok_or_else(|| AppError::Validation(format!("Invalid option '{option}'")))?
            .to_string();

        let voters_key = keys::voters(poll_id);
        if self.store.is_member(&voters_key, voter).await? {
            return Err(already_voted(voter, poll_id));
        }

        let ops = vec![
            BatchOp::IncrementField {
                key: keys::votes(poll_id),
                field: canonical.clone(),
                delta: 1,
            },
            BatchOp::SetFields {
                key: keys::user_votes(voter),
                fields: vec![(poll_id.to_string(), canonical.clone())],
            },
        ];
        if !self
            .store
            .atomic_batch_if_added(&voters_key, voter, ops)
            .await?
        {
            return Err(already_voted(voter, poll_id));
        }

        info!("Vote recorded on poll {poll_id} by {voter}");
        debug!("{voter} chose '{canonical}' on poll {poll_id}");
        Ok(())
    }

    /// Current counts. A poll nobody voted on yet has an empty tally.
    pub async fn tally(&self, poll_id: &str) -> Result<Tally, AppError> {
        let key = keys::votes(poll_id);
        let raw = self.store.get_fields(&key).await?;
        raw.into_iter()
            .map(|(option, count)| {
                count.parse::<u64>().map(|n| (option, n)).map_err(|_| {
                    AppError::from(StoreError::MalformedResponse(format!(
                        "{key} has non-numeric count '{count}'"
                    )))
                })
            })
            .collect()
    }

    /// Poll id -> chosen option for every vote `voter` cast.
    pub async fn user_votes(&self, voter: &str) -> Result<BTreeMap<String, String>, AppError> {
        let log = self.store.get_fields(&keys::user_votes(voter)).await?;
        Ok(log.into_iter().collect())
    }

    /// Every poll together with its tally.
    pub async fn results(&self) -> Result<Vec<PollView>, AppError> {
        let now = Utc::now();
        let mut views = Vec::new();
        for poll in self.polls.list(false).await? {
            let votes = self.tally(&poll.id).await?;
            views.push(PollView {
                status: poll.status_at(now),
                poll,
                votes: Some(votes),
            });
        }
        Ok(views)
    }
}

fn already_voted(voter: &str, poll_id: &str) -> AppError {
    debug!("{voter} already voted on poll {poll_id}");
    AppError::Conflict("User already voted".into())
}
