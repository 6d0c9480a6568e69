//! Controlled vocabulary endpoint.

use axum::{extract::State, Json};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::state::AppState;
use crate::vocabulary::VocabularyTable;

#[derive(Serialize)]
pub struct VocabularyResponse<'a> {
    #[serde(flatten)]
    pub table: &'a VocabularyTable,
    /// ECV group name to canonical variables
    pub ecv_groups: BTreeMap<String, BTreeSet<String>>,
}

/// Handle GET /vocabulary requests
pub async fn vocabulary_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let vocabulary = state.federation.vocabulary();
    let response = VocabularyResponse {
        table: vocabulary.table(),
        ecv_groups: vocabulary.ecv_groups(),
    };
    Json(serde_json::to_value(response).unwrap_or_default())
}
