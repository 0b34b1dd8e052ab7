//! User read-model endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use event_store::EventStore;
use projections::{UserDetail, UserSummary};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct DetailParams {
    pub user_id: Option<String>,
}

#[derive(Serialize)]
pub struct DetailResponse {
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "Balance")]
    pub balance: i64,
}

impl From<UserDetail> for DetailResponse {
    fn from(detail: UserDetail) -> Self {
        Self {
            user_id: detail.user_id.into_inner(),
            name: detail.name,
            email: detail.email,
            balance: detail.balance,
        }
    }
}

#[derive(Serialize)]
pub struct SummaryResponse {
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "Name")]
    pub name: String,
}

impl From<UserSummary> for SummaryResponse {
    fn from(summary: UserSummary) -> Self {
        Self {
            user_id: summary.user_id.into_inner(),
            name: summary.name,
        }
    }
}

#[derive(Serialize)]
pub struct ListResponse {
    pub users: Vec<SummaryResponse>,
}

/// GET /detail?user_id=: one user's detail record.
#[tracing::instrument(skip(state, params), fields(user_id = ?params.user_id))]
pub async fn detail<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(params): Query<DetailParams>,
) -> Result<Json<DetailResponse>, ApiError> {
    let detail = state.queries.get_detail(params.user_id.as_deref()).await?;
    Ok(Json(detail.into()))
}

/// GET /list: every user summary.
#[tracing::instrument(skip(state))]
pub async fn list<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<ListResponse>, ApiError> {
    let users = state
        .queries
        .list_summaries_within(state.query_timeout)
        .await?;

    Ok(Json(ListResponse {
        users: users.into_iter().map(SummaryResponse::from).collect(),
    }))
}
