// src/poll.rs
use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, StoreError};
use crate::models::{Poll, SearchFilter};
use crate::store::{keys, BatchOp, Fields, KvStore};

/// How many polls are reconstructed concurrently while listing.
const FETCH_CONCURRENCY: usize = 16;

pub struct PollRepository {
    store: Arc<dyn KvStore>,
    read_timeout: Duration,
    scan_batch: usize,
}

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn field<'a>(fields: &'a Fields, name: &str, key: &str) -> Result<&'a str, StoreError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::MalformedResponse(format!("{key} has no '{name}' field")))
}

fn parse_time(fields: &Fields, name: &str, key: &str) -> Result<DateTime<Utc>, StoreError> {
    let raw = field(fields, name, key)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::MalformedResponse(format!("{key}.{name} = '{raw}': {e}")))
}

fn encode_poll(poll: &Poll) -> Vec<(String, String)> {
    vec![
        ("id".into(), poll.id.clone()),
        ("question".into(), poll.question.clone()),
        ("created_by".into(), poll.created_by.clone()),
        ("updated_by".into(), poll.updated_by.clone()),
        ("created_at".into(), format_time(poll.created_at)),
        ("expires_at".into(), format_time(poll.expires_at)),
        ("is_closed".into(), poll.is_closed.to_string()),
    ]
}

fn encode_options(options: &[String]) -> Vec<(String, String)> {
    options
        .iter()
        .enumerate()
        .map(|(idx, opt)| (idx.to_string(), opt.clone()))
        .collect()
}

fn decode_options(fields: Fields, key: &str) -> Result<Vec<String>, StoreError> {
    let mut indexed = fields
        .into_iter()
        .map(|(idx, opt)| {
            idx.parse::<usize>()
                .map(|i| (i, opt))
                .map_err(|_| StoreError::MalformedResponse(format!("{key} has non-numeric field '{idx}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    indexed.sort_by_key(|(i, _)| *i);

    if indexed.iter().enumerate().any(|(pos, (i, _))| pos != *i) {
        return Err(StoreError::MalformedResponse(format!(
            "{key} option positions are not contiguous"
        )));
    }
    Ok(indexed.into_iter().map(|(_, opt)| opt).collect())
}

fn decode_poll(meta: &Fields, options: Fields, key: &str) -> Result<Poll, StoreError> {
    let is_closed = match field(meta, "is_closed", key)? {
        "true" => true,
        "false" => false,
        other => {
            return Err(StoreError::MalformedResponse(format!(
                "{key}.is_closed = '{other}'"
            )))
        }
    };

    Ok(Poll {
        id: field(meta, "id", key)?.to_string(),
        question: field(meta, "question", key)?.to_string(),
        options: decode_options(options, &keys::options(field(meta, "id", key)?))?,
        created_by: field(meta, "created_by", key)?.to_string(),
        updated_by: field(meta, "updated_by", key)?.to_string(),
        created_at: parse_time(meta, "created_at", key)?,
        expires_at: parse_time(meta, "expires_at", key)?,
        is_closed,
    })
}

fn validate(question: &str, options: &[String], ttl_minutes: u32) -> Result<(), AppError> {
    if question.is_empty() {
        return Err(AppError::Validation("Question must not be empty".into()));
    }
    if options.len() < 2 {
        return Err(AppError::Validation("A poll needs at least 2 options".into()));
    }
    if options.iter().any(String::is_empty) {
        return Err(AppError::Validation("Options must not be empty".into()));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = options.iter().find(|o| !seen.insert(o.to_lowercase())) {
        return Err(AppError::Validation(format!("Duplicate option '{dup}'")));
    }
    if ttl_minutes == 0 {
        return Err(AppError::Validation("expires_in must be at least 1 minute".into()));
    }
    Ok(())
}

impl PollRepository {
    pub fn new(store: Arc<dyn KvStore>, read_timeout: Duration, scan_batch: usize) -> Self {
        Self {
            store,
            read_timeout,
            scan_batch,
        }
    }

    pub async fn create(
        &self,
        question: &str,
        options: &[String],
        creator: &str,
        ttl_minutes: u32,
    ) -> Result<Poll, AppError> {
        let question = question.trim();
        let options: Vec<String> = options.iter().map(|o| o.trim().to_string()).collect();
        validate(question, &options, ttl_minutes)?;

        let now = Utc::now();
        let poll = Poll {
            id: Uuid::new_v4().to_string(),
            question: question.to_string(),
            options,
            created_by: creator.to_string(),
            updated_by: creator.to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::minutes(i64::from(ttl_minutes)),
            is_closed: false,
        };

        self.insert(&poll).await?;
        info!("Poll {} created by {}", poll.id, poll.created_by);
        Ok(poll)
    }

    /// Writes metadata and options in one batch so a poll is never visible
    /// without its options.
    pub(crate) async fn insert(&self, poll: &Poll) -> Result<(), AppError> {
        self.store
            .atomic_batch(vec![
                BatchOp::SetFields {
                    key: keys::poll(&poll.id),
                    fields: encode_poll(poll),
                },
                BatchOp::SetFields {
                    key: keys::options(&poll.id),
                    fields: encode_options(&poll.options),
                },
            ])
            .await?;
        Ok(())
    }

    /// Reads metadata and options concurrently under one shared deadline.
    pub async fn get(&self, id: &str) -> Result<Poll, AppError> {
        let key = keys::poll(id);
        let options_key = keys::options(id);

        let (meta, options) = tokio::time::timeout(self.read_timeout, async {
            tokio::try_join!(
                self.store.get_fields(&key),
                self.store.get_fields(&options_key)
            )
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        if meta.is_empty() || options.is_empty() {
            return Err(AppError::NotFound(format!("Poll {id} not found")));
        }
        Ok(decode_poll(&meta, options, &key)?)
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<Poll>, AppError> {
        let now = Utc::now();
        let mut polls = self.load_all().await?;
        if active_only {
            polls.retain(|p| p.status_at(now).accepts_votes());
        }
        Ok(polls)
    }

    /// Full scan, then filter. There is no secondary index.
    pub async fn search(&self, filter: &SearchFilter) -> Result<Vec<Poll>, AppError> {
        let mut polls = self.load_all().await?;
        polls.retain(|p| filter.matches(p));
        Ok(polls)
    }

    /// Flips the closed flag. Authorization is the caller's job.
    pub async fn close(&self, id: &str, by: &str) -> Result<(), AppError> {
        let key = keys::poll(id);
        let meta = self.store.get_fields(&key).await?;
        if meta.is_empty() {
            return Err(AppError::NotFound(format!("Poll {id} not found")));
        }
        if meta.get("is_closed").map(String::as_str) == Some("true") {
            debug!("Poll {id} already closed");
            return Ok(());
        }

        // a delete may land after the read; never recreate the hash then
        let written = self
            .store
            .set_fields_if_exists(
                &key,
                &[
                    ("is_closed".into(), "true".into()),
                    ("updated_by".into(), by.to_string()),
                ],
            )
            .await?;
        if !written {
            return Err(AppError::NotFound(format!("Poll {id} not found")));
        }
        info!("Poll {id} closed by {by}");
        Ok(())
    }

    /// Removes the poll together with its options, tally, voter set and the
    /// voters' log entries for it.
    pub async fn delete(&self, id: &str, requester: &str, is_admin: bool) -> Result<(), AppError> {
        let key = keys::poll(id);
        let meta = self.store.get_fields(&key).await?;
        if meta.is_empty() {
            return Err(AppError::NotFound(format!("Poll {id} not found")));
        }

        let created_by = field(&meta, "created_by", &key)?;
        if created_by != requester && !is_admin {
            warn!("{requester} tried to delete poll {id} owned by {created_by}");
            return Err(AppError::Forbidden(
                "You are not allowed to delete this poll".into(),
            ));
        }

        let voters = self.store.set_members(&keys::voters(id)).await?;
        let mut ops: Vec<BatchOp> = [key, keys::options(id), keys::votes(id), keys::voters(id)]
            .into_iter()
            .map(|key| BatchOp::Delete { key })
            .collect();
        ops.extend(voters.iter().map(|voter| BatchOp::DeleteField {
            key: keys::user_votes(voter),
            field: id.to_string(),
        }));

        self.store.atomic_batch(ops).await?;
        info!("Poll {id} deleted by {requester} ({} votes removed)", voters.len());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Poll>, AppError> {
        let ids: Vec<String> = self
            .store
            .scan_keys_by_prefix(keys::POLL_PREFIX, self.scan_batch)
            .await?
            .iter()
            .filter_map(|k| keys::poll_id(k))
            .map(str::to_string)
            .collect();

        let results: Vec<Result<Poll, AppError>> = stream::iter(ids)
            .map(|id| async move { self.get(&id).await })
            .buffer_unordered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut polls = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(poll) => polls.push(poll),
                // deleted between the scan and the read
                Err(AppError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(polls)
    }
}
