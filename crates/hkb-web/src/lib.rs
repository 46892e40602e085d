//! Axum façade over the managed relational store plus the agent runtime.
//!
//! The database surface is a fixed action vocabulary dispatched from one
//! endpoint, each action mapped 1:1 to a parameterized query. CORS headers
//! ride on every response and OPTIONS preflights short-circuit.

pub mod agent;

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::net::TcpListener;
use tracing::warn;

use agent::{AgentRuntime, HttpAgentRuntime};

pub const CRATE_NAME: &str = "hkb-web";

pub const AVAILABLE_ACTIONS: [&str; 5] = [
    "health_check",
    "test_db_connection",
    "get_patients",
    "get_patient_by_id",
    "list_tables",
];

#[derive(Clone)]
pub struct AppState {
    pool: Option<PgPool>,
    db_name: String,
    agent: Option<Arc<dyn AgentRuntime>>,
}

impl AppState {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            pool: None,
            db_name: db_name.into(),
            agent: None,
        }
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_agent(mut self, agent: Arc<dyn AgentRuntime>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub async fn from_env() -> Self {
        let db_name =
            std::env::var("HKB_DB_NAME").unwrap_or_else(|_| "medical_records".to_string());
        let mut state = Self::new(db_name);

        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            match PgPool::connect(&database_url).await {
                Ok(pool) => state.pool = Some(pool),
                Err(err) => warn!(error = %err, "database connection failed; db actions degrade"),
            }
        }
        if let Ok(endpoint) = std::env::var("AGENT_RUNTIME_URL") {
            state.agent = Some(Arc::new(HttpAgentRuntime::new(endpoint)));
        }
        state
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DbRequest {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub medical_record_number: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/db", post(db_handler).options(preflight_handler))
        .route("/agent", post(agent_handler).options(preflight_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("HKB_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::from_env().await;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn facade_response(status: StatusCode, body: Value) -> Response {
    let mut response = (status, axum::Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type,X-Amz-Date,Authorization,X-Api-Key,X-Amz-Security-Token"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,POST,PUT,DELETE,OPTIONS"),
    );
    response
}

async fn preflight_handler() -> Response {
    facade_response(StatusCode::OK, json!({ "message": "CORS preflight" }))
}

async fn db_handler(State(state): State<Arc<AppState>>, Json(request): Json<DbRequest>) -> Response {
    let (status, body) = match request.action.as_deref() {
        Some("health_check") => health_check(&state),
        Some("test_db_connection") => test_db_connection(&state).await,
        Some("get_patients") => get_patients(&state).await,
        Some("get_patient_by_id") => get_patient_by_id(&state, &request).await,
        Some("list_tables") => list_tables(&state).await,
        _ => available_actions(),
    };
    facade_response(status, body)
}

async fn agent_handler(State(state): State<Arc<AppState>>, Json(payload): Json<Value>) -> Response {
    let Some(prompt) = agent::extract_prompt(&payload) else {
        return facade_response(StatusCode::BAD_REQUEST, json!({ "error": "Prompt is required" }));
    };
    let Some(runtime) = &state.agent else {
        return facade_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "agent runtime not configured" }),
        );
    };
    match runtime.invoke(&prompt).await {
        Ok(raw) => facade_response(
            StatusCode::OK,
            json!({ "response": agent::clean_agent_response(&raw) }),
        ),
        Err(err) => facade_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": err.to_string() }),
        ),
    }
}

fn available_actions() -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({
            "message": "Database handler ready",
            "available_actions": AVAILABLE_ACTIONS,
        }),
    )
}

fn health_check(state: &AppState) -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({
            "message": "Database handler is healthy",
            "environment": {
                "db_name": state.db_name,
                "has_database": state.pool.is_some(),
                "has_agent_runtime": state.agent.is_some(),
            },
        }),
    )
}

async fn test_db_connection(state: &AppState) -> (StatusCode, Value) {
    let Some(pool) = &state.pool else {
        return (
            StatusCode::OK,
            json!({
                "status": "partial_success",
                "message": "no database configured",
                "note": "DATABASE_URL not set - cannot test actual connection",
            }),
        );
    };
    match sqlx::query("SELECT 1 AS test_connection").fetch_one(pool).await {
        Ok(_) => (
            StatusCode::OK,
            json!({
                "status": "success",
                "message": "Database connection successful",
                "database": state.db_name,
            }),
        ),
        Err(err) => db_error(format!("Database connection failed: {err}")),
    }
}

fn db_error(message: String) -> (StatusCode, Value) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "status": "error", "message": message }),
    )
}

const PATIENT_LIST_COLUMNS: [&str; 11] = [
    "patient_id",
    "medical_record_number",
    "first_name",
    "last_name",
    "middle_name",
    "date_of_birth",
    "gender",
    "phone_primary",
    "email",
    "city",
    "state",
];

const PATIENT_DETAIL_COLUMNS: [&str; 25] = [
    "patient_id",
    "medical_record_number",
    "first_name",
    "last_name",
    "middle_name",
    "date_of_birth",
    "gender",
    "phone_primary",
    "phone_secondary",
    "email",
    "address_line1",
    "address_line2",
    "city",
    "state",
    "zip_code",
    "country",
    "emergency_contact_name",
    "emergency_contact_phone",
    "emergency_contact_relationship",
    "insurance_provider",
    "insurance_policy_number",
    "insurance_group_number",
    "active",
    "created_at",
    "updated_at",
];

const PATIENT_LIST_SQL: &str = r#"
    SELECT patient_id::text AS patient_id, medical_record_number, first_name, last_name,
           middle_name, date_of_birth::text AS date_of_birth, gender, phone_primary,
           email, city, state
      FROM patients
     WHERE active = true
     ORDER BY last_name, first_name
"#;

const PATIENT_DETAIL_SELECT: &str = r#"
    SELECT patient_id::text AS patient_id, medical_record_number, first_name, last_name,
           middle_name, date_of_birth::text AS date_of_birth, gender, phone_primary,
           phone_secondary, email, address_line1, address_line2, city, state, zip_code,
           country, emergency_contact_name, emergency_contact_phone,
           emergency_contact_relationship, insurance_provider, insurance_policy_number,
           insurance_group_number, active::text AS active, created_at::text AS created_at,
           updated_at::text AS updated_at
      FROM patients
"#;

fn row_object(row: &PgRow, columns: &[&str]) -> anyhow::Result<Value> {
    let mut object = serde_json::Map::new();
    for column in columns {
        let value: Option<String> = row.try_get(*column)?;
        object.insert(
            (*column).to_string(),
            value.map(Value::String).unwrap_or(Value::Null),
        );
    }
    Ok(Value::Object(object))
}

async fn get_patients(state: &AppState) -> (StatusCode, Value) {
    let Some(pool) = &state.pool else {
        return db_error("no database configured".to_string());
    };
    let rows = match sqlx::query(PATIENT_LIST_SQL).fetch_all(pool).await {
        Ok(rows) => rows,
        Err(err) => return db_error(format!("Error retrieving patients: {err}")),
    };

    let mut patients = Vec::with_capacity(rows.len());
    for row in &rows {
        match row_object(row, &PATIENT_LIST_COLUMNS) {
            Ok(patient) => patients.push(patient),
            Err(err) => return db_error(format!("Error retrieving patients: {err}")),
        }
    }

    (
        StatusCode::OK,
        json!({
            "status": "success",
            "message": format!("Retrieved {} patients", patients.len()),
            "count": patients.len(),
            "patients": patients,
        }),
    )
}

async fn get_patient_by_id(state: &AppState, request: &DbRequest) -> (StatusCode, Value) {
    let Some(pool) = &state.pool else {
        return db_error("no database configured".to_string());
    };

    let (sql, identifier) = if let Some(patient_id) = &request.patient_id {
        (
            format!("{PATIENT_DETAIL_SELECT} WHERE patient_id = $1::uuid AND active = true"),
            patient_id.clone(),
        )
    } else if let Some(mrn) = &request.medical_record_number {
        (
            format!("{PATIENT_DETAIL_SELECT} WHERE medical_record_number = $1 AND active = true"),
            mrn.clone(),
        )
    } else {
        return db_error("Either patient_id or medical_record_number is required".to_string());
    };

    match sqlx::query(&sql).bind(identifier).fetch_optional(pool).await {
        Ok(Some(row)) => match row_object(&row, &PATIENT_DETAIL_COLUMNS) {
            Ok(patient) => (
                StatusCode::OK,
                json!({
                    "status": "success",
                    "message": "Patient retrieved successfully",
                    "patient": patient,
                }),
            ),
            Err(err) => db_error(format!("Error retrieving patient: {err}")),
        },
        Ok(None) => (
            StatusCode::NOT_FOUND,
            json!({
                "status": "not_found",
                "message": "Patient not found",
                "patient": null,
            }),
        ),
        Err(err) => db_error(format!("Error retrieving patient: {err}")),
    }
}

async fn list_tables(state: &AppState) -> (StatusCode, Value) {
    let Some(pool) = &state.pool else {
        return db_error("no database configured".to_string());
    };
    let rows = match sqlx::query(
        "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public' ORDER BY table_name",
    )
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(err) => return db_error(format!("Error listing tables: {err}")),
    };

    let mut tables = Vec::with_capacity(rows.len());
    for row in &rows {
        match row.try_get::<String, _>("table_name") {
            Ok(name) => tables.push(name),
            Err(err) => return db_error(format!("Error listing tables: {err}")),
        }
    }

    (
        StatusCode::OK,
        json!({
            "status": "success",
            "message": format!("Found {} tables in database \"{}\"", tables.len(), state.db_name),
            "database": state.db_name,
            "tables": tables,
            "count": tables.len(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct CannedRuntime;

    #[async_trait]
    impl AgentRuntime for CannedRuntime {
        async fn invoke(&self, prompt: &str) -> anyhow::Result<String> {
            Ok(format!(
                "<thinking>considering {prompt}</thinking><response>echo: {prompt}</response>"
            ))
        }
    }

    fn json_request(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn preflight_short_circuits_with_cors_headers() {
        let app = app(AppState::new("medical_records"));
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/db")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN]
                .to_str()
                .expect("header"),
            "*"
        );
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS]
                .to_str()
                .expect("header"),
            "GET,POST,PUT,DELETE,OPTIONS"
        );
    }

    #[tokio::test]
    async fn unknown_action_lists_the_vocabulary() {
        let app = app(AppState::new("medical_records"));
        let response = app.oneshot(json_request("/db", "{}")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(
            body["available_actions"].as_array().expect("actions").len(),
            AVAILABLE_ACTIONS.len()
        );
    }

    #[tokio::test]
    async fn health_check_reports_configuration() {
        let app = app(AppState::new("medical_records"));
        let response = app
            .oneshot(json_request("/db", r#"{"action":"health_check"}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["environment"]["db_name"], "medical_records");
        assert_eq!(body["environment"]["has_database"], false);
    }

    #[tokio::test]
    async fn connection_test_degrades_without_database() {
        let app = app(AppState::new("medical_records"));
        let response = app
            .oneshot(json_request("/db", r#"{"action":"test_db_connection"}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "partial_success");
    }

    #[tokio::test]
    async fn data_actions_error_without_database() {
        let app = app(AppState::new("medical_records"));
        for action in ["get_patients", "list_tables"] {
            let response = app
                .clone()
                .oneshot(json_request("/db", &format!(r#"{{"action":"{action}"}}"#)))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let body = body_json(response).await;
            assert_eq!(body["status"], "error");
        }
    }

    #[tokio::test]
    async fn patient_lookup_requires_an_identifier() {
        let app = app(AppState::new("medical_records"));
        let response = app
            .oneshot(json_request("/db", r#"{"action":"get_patient_by_id"}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn agent_round_trip_cleans_the_response() {
        let state = AppState::new("medical_records").with_agent(Arc::new(CannedRuntime));
        let app = app(state);
        let response = app
            .oneshot(json_request("/agent", r#"{"prompt":"what is insulin?"}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["response"], "echo: what is insulin?");
    }

    #[tokio::test]
    async fn agent_requires_a_prompt() {
        let state = AppState::new("medical_records").with_agent(Arc::new(CannedRuntime));
        let app = app(state);
        let response = app.oneshot(json_request("/agent", "{}")).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Prompt is required");
    }
}
