//! Hand-assembled OpenAPI 3.0.3 document (`spec.md` §6 "API documentation
//! surface"). Built as a plain `serde_json::Value` tree rather than pulled
//! in via a codegen crate, matching the teacher's preference for explicit
//! DTOs over macro-generated schemas.

use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde_json::json;

fn spec_document() -> serde_json::Value {
    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "AgentGate",
            "version": "1.0.0",
            "description": "Schedules and executes long-running AI coding agent work orders through a Build -> Snapshot -> Verify -> Feedback loop."
        },
        "servers": [{ "url": "/api/v1" }],
        "components": {
            "securitySchemes": {
                "ApiKeyAuth": { "type": "apiKey", "in": "header", "name": "X-API-Key" }
            }
        },
        "security": [{ "ApiKeyAuth": [] }],
        "paths": {
            "/work-orders": {
                "get": { "summary": "List work orders", "responses": { "200": { "description": "OK" } } },
                "post": { "summary": "Create a work order", "responses": { "200": { "description": "Created" } } }
            },
            "/work-orders/{id}": {
                "get": { "summary": "Get a work order", "responses": { "200": { "description": "OK" }, "404": { "description": "Not found" } } },
                "delete": { "summary": "Cancel a work order", "responses": { "200": { "description": "Cancelled" } } }
            },
            "/runs": {
                "get": { "summary": "List runs", "responses": { "200": { "description": "OK" } } }
            },
            "/runs/{id}": {
                "get": { "summary": "Get a run", "responses": { "200": { "description": "OK" }, "404": { "description": "Not found" } } }
            },
            "/runs/{id}/config": {
                "get": { "summary": "Get the configuration a run executed with", "responses": { "200": { "description": "OK" } } }
            },
            "/runs/{id}/strategy-state": {
                "get": { "summary": "Get the Loop Strategy's observed state for a run", "responses": { "200": { "description": "OK" } } }
            },
            "/audit/runs/{runId}": {
                "get": { "summary": "Get a run's audit timeline", "responses": { "200": { "description": "OK" } } }
            },
            "/audit/runs/{runId}/snapshots": {
                "get": { "summary": "Get a run's snapshots, optionally filtered by iteration", "responses": { "200": { "description": "OK" } } }
            },
            "/audit/runs/{runId}/changes": {
                "get": { "summary": "Get a run's file-change summary per snapshot", "responses": { "200": { "description": "OK" } } }
            }
        }
    })
}

pub async fn openapi_json() -> Json<serde_json::Value> {
    Json(spec_document())
}

pub async fn openapi_yaml() -> Response {
    match serde_yaml::to_string(&spec_document()) {
        Ok(yaml) => (
            [(header::CONTENT_TYPE, "application/yaml")],
            yaml,
        )
            .into_response(),
        Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn openapi_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head><title>AgentGate API Docs</title></head>
<body>
<div id="swagger-ui"></div>
<script src="https://unpkg.com/swagger-ui-dist/swagger-ui-bundle.js"></script>
<script>
window.onload = () => SwaggerUIBundle({ url: "/docs/json", dom_id: "#swagger-ui" });
</script>
</body>
</html>"#,
    )
}
