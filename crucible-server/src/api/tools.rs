use axum::extract::State;
use axum::Json;

use super::error::ApiError;
use super::schemas::{
    ExecuteCustomToolRequest, ExecuteCustomToolResponse, ParseCustomToolRequest,
    ParseCustomToolResponse,
};
use super::AppState;

/// `POST /v1/parse-custom-tool` -- extract name, schema, and description
/// from a tool source.
pub async fn parse_custom_tool(
    State(state): State<AppState>,
    Json(body): Json<ParseCustomToolRequest>,
) -> Result<Json<ParseCustomToolResponse>, ApiError> {
    let tool = state.broker.parse_custom_tool(&body.tool_source_code)?;
    Ok(Json(ParseCustomToolResponse {
        tool_name: tool.name,
        tool_input_schema_json: tool.input_schema.to_string(),
        tool_description: tool.description,
    }))
}

/// `POST /v1/execute-custom-tool` -- validate the arguments and run the
/// tool in a fresh worker.
pub async fn execute_custom_tool(
    State(state): State<AppState>,
    Json(body): Json<ExecuteCustomToolRequest>,
) -> Result<Json<ExecuteCustomToolResponse>, ApiError> {
    let tool_output_json = state
        .broker
        .execute_custom_tool(&body.tool_source_code, &body.tool_input_json, &body.env)
        .await?;
    Ok(Json(ExecuteCustomToolResponse { tool_output_json }))
}
