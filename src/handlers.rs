// handlers.rs
use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    Json,
};
use serde_json::{json, Value};

use crate::auth::Identity;
use crate::error::AppError;
use crate::models::{
    CreatePollRequest, CreatePollResponse, GetPollQuery, ListQuery, Poll, PollView, SearchFilter,
    TallyResponse, VoteRequest,
};
use crate::state::AppState;

type Shared = State<Arc<AppState>>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| AppError::Validation(e.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    params
        .map(|Query(v)| v)
        .map_err(|e| AppError::Validation(e.body_text()))
}

fn views(polls: Vec<Poll>) -> Vec<PollView> {
    polls
        .into_iter()
        .map(|poll| PollView {
            status: poll.status(),
            poll,
            votes: None,
        })
        .collect()
}

/// Create a poll owned by the caller
pub async fn create_poll(
    State(state): Shared,
    identity: Identity,
    payload: Result<Json<CreatePollRequest>, JsonRejection>,
) -> Result<Json<CreatePollResponse>, AppError> {
    let req = body(payload)?;
    let poll = state
        .polls
        .create(&req.question, &req.options, &identity.id, req.expires_in)
        .await?;
    Ok(Json(CreatePollResponse { poll_id: poll.id }))
}

/// List polls, optionally only those still accepting votes
pub async fn list_polls(
    State(state): Shared,
    _identity: Identity,
    params: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Value>, AppError> {
    let params = query(params)?;
    let polls = state.polls.list(params.active_only).await?;
    Ok(Json(json!({ "polls": views(polls) })))
}

pub async fn search_polls(
    State(state): Shared,
    _identity: Identity,
    params: Result<Query<SearchFilter>, QueryRejection>,
) -> Result<Json<Vec<PollView>>, AppError> {
    let filter = query(params)?;
    let polls = state.polls.search(&filter).await?;
    Ok(Json(views(polls)))
}

/// Every poll with its vote counts
pub async fn poll_results(
    State(state): Shared,
    _identity: Identity,
) -> Result<Json<Vec<PollView>>, AppError> {
    Ok(Json(state.votes.results().await?))
}

pub async fn get_poll(
    State(state): Shared,
    _identity: Identity,
    Path(id): Path<String>,
    params: Result<Query<GetPollQuery>, QueryRejection>,
) -> Result<Json<Value>, AppError> {
    let params = query(params)?;
    let poll = state.polls.get(&id).await?;
    let votes = if params.with_votes {
        Some(state.votes.tally(&id).await?)
    } else {
        None
    };
    let view = PollView {
        status: poll.status(),
        poll,
        votes,
    };
    Ok(Json(json!({ "data": view })))
}

/// Close a poll (admin only)
pub async fn close_poll(
    State(state): Shared,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    if !identity.is_admin() {
        return Err(AppError::Forbidden("Only admins can close polls".into()));
    }
    state.polls.close(&id, &identity.id).await?;
    Ok(Json(json!({ "message": "Poll closed successfully" })))
}

pub async fn delete_poll(
    State(state): Shared,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state
        .polls
        .delete(&id, &identity.id, identity.is_admin())
        .await?;
    Ok(Json(json!({ "message": "Poll deleted successfully" })))
}

/// Cast the caller's single vote on a poll
pub async fn vote(
    State(state): Shared,
    identity: Identity,
    Path(id): Path<String>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let req = body(payload)?;
    state.votes.cast_vote(&id, &identity.id, &req.option).await?;
    Ok(Json(json!({ "message": "Vote recorded successfully" })))
}

pub async fn get_tally(
    State(state): Shared,
    _identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<TallyResponse>, AppError> {
    let poll = state.polls.get(&id).await?;
    let votes = state.votes.tally(&id).await?;
    let total = votes.values().sum();
    Ok(Json(TallyResponse {
        poll: PollView {
            status: poll.status(),
            poll,
            votes: None,
        },
        votes,
        total,
    }))
}

/// The caller's own vote log
pub async fn my_votes(
    State(state): Shared,
    identity: Identity,
) -> Result<Json<BTreeMap<String, String>>, AppError> {
    Ok(Json(state.votes.user_votes(&identity.id).await?))
}
