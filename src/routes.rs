// routes.rs
use std::{sync::Arc, time::Duration};

use axum::{
    routing::{get, post},
    Router,
};
use http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    Method,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers;
use crate::state::AppState;

pub fn create_routes(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/polls", post(handlers::create_poll).get(handlers::list_polls))
        .route("/polls/search", get(handlers::search_polls))
        .route("/polls/results", get(handlers::poll_results))
        .route("/polls/{id}", get(handlers::get_poll).delete(handlers::delete_poll))
        .route("/polls/{id}/close", post(handlers::close_poll))
        .route("/polls/{id}/vote", post(handlers::vote))
        .route("/polls/{id}/tally", get(handlers::get_tally))
        .route("/users/me/votes", get(handlers::my_votes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
