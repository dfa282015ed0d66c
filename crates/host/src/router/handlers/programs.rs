//! `/programs` collection and individual-program handlers.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::ProgramRecord;

use super::super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateProgramRequest {
    pub user_id: String,
    #[serde(default)]
    pub dockerfile: String,
    pub src_files: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct CreateProgramResponse {
    pub program_id: String,
    pub state: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ProgramSummary {
    pub program_id: String,
    pub user_id: String,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl From<&ProgramRecord> for ProgramSummary {
    fn from(r: &ProgramRecord) -> Self {
        Self {
            program_id: r.program_id.clone(),
            user_id: r.user_id.clone(),
            state: r.state.as_str(),
            host_port: r.host_port,
            error_msg: r.error_msg.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProgramDetail {
    pub program_id: String,
    pub user_id: String,
    pub state: &'static str,
    pub image_tag: Option<String>,
    pub container_id: Option<String>,
    pub host_port: Option<u16>,
    pub error_msg: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub state_changed_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_log: Option<String>,
}

impl ProgramDetail {
    fn from_record(r: &ProgramRecord, include_log: bool) -> Self {
        Self {
            program_id: r.program_id.clone(),
            user_id: r.user_id.clone(),
            state: r.state.as_str(),
            image_tag: r.image_tag.clone(),
            container_id: r.container_id.clone(),
            host_port: r.host_port,
            error_msg: r.error_msg.clone(),
            created_at: r.created_at,
            state_changed_at: r.state_changed_at,
            build_log: include_log.then(|| r.build_log.text()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub program_id: String,
    pub state: &'static str,
}

impl From<ProgramRecord> for TransitionResponse {
    fn from(r: ProgramRecord) -> Self {
        Self { program_id: r.program_id, state: r.state.as_str() }
    }
}

pub async fn create_program(
    State(state): State<AppState>,
    Json(req): Json<CreateProgramRequest>,
) -> Result<Response> {
    let program_id = state.engine.submit(req.user_id, req.dockerfile, req.src_files)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateProgramResponse { program_id, state: "Pending" }),
    )
        .into_response())
}

pub async fn list_programs(State(state): State<AppState>) -> Json<Vec<ProgramSummary>> {
    let records = state.engine.list();
    Json(records.iter().map(ProgramSummary::from).collect())
}

#[derive(Debug, Deserialize)]
pub struct GetProgramQuery {
    #[serde(default)]
    logs: u8,
}

pub async fn get_program(
    State(state): State<AppState>,
    Path(program_id): Path<String>,
    Query(query): Query<GetProgramQuery>,
) -> Result<Json<ProgramDetail>> {
    let record = state
        .engine
        .get(&program_id)
        .ok_or_else(|| crate::error::HostError::NotFound(program_id.clone()))?;
    Ok(Json(ProgramDetail::from_record(&record, query.logs == 1)))
}

pub async fn start_program(
    State(state): State<AppState>,
    Path(program_id): Path<String>,
) -> Result<Json<TransitionResponse>> {
    let record = state.engine.start(&program_id).await?;
    Ok(Json(record.into()))
}

pub async fn stop_program(
    State(state): State<AppState>,
    Path(program_id): Path<String>,
) -> Result<Json<TransitionResponse>> {
    let record = state.engine.stop(&program_id).await?;
    Ok(Json(record.into()))
}

pub async fn delete_program(
    State(state): State<AppState>,
    Path(program_id): Path<String>,
) -> Result<StatusCode> {
    state.engine.delete(&program_id)?;
    Ok(StatusCode::NO_CONTENT)
}
