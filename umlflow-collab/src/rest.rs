//! REST client for the diagram backend.
//!
//! The backend is consumed, not owned: JSON bodies over HTTP with a
//! per-call bearer credential, diagram payloads carried as the opaque
//! `{classes, associations}` JSON object. Status mapping is uniform:
//! 401 → [`ApiError::AuthExpired`], 404 → [`ApiError::NotFound`],
//! 422 → [`ApiError::ValidationFailed`], transport errors → `Network`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use umlflow_core::{Diagram, DiagramData};

use crate::backend::{ApiError, DiagramBackend};

/// Per-request timeout; expiry is treated as a save/load failure.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Diagram as the backend serves it.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiDiagram {
    pub id: String,
    pub project_id: String,
    pub diagram_data: DiagramData,
    pub version: u64,
    pub created_at: String,
    pub updated_at: String,
}

impl From<ApiDiagram> for Diagram {
    fn from(api: ApiDiagram) -> Self {
        Diagram {
            id: api.id,
            version: api.version,
            data: api.diagram_data,
        }
    }
}

#[derive(Serialize)]
struct CreateDiagramRequest<'a> {
    project_id: &'a str,
    diagram_data: &'a DiagramData,
}

#[derive(Serialize)]
struct UpdateDiagramRequest<'a> {
    diagram_data: &'a DiagramData,
}

#[derive(Serialize)]
struct CreateProjectRequest<'a> {
    name: &'a str,
}

/// HTTP client for the backend REST surface.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    /// Create a client against the given base URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    // ─── Auth ─────────────────────────────────────────────────────────

    pub async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, ApiError> {
        let response = self
            .http
            .post(self.url("/register"))
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::parse(response).await
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ApiError> {
        let response = self
            .http
            .post(self.url("/login"))
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::parse(response).await
    }

    pub async fn me(&self, token: &str) -> Result<User, ApiError> {
        let response = self
            .http
            .get(self.url("/me"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::parse(response).await
    }

    // ─── Projects ─────────────────────────────────────────────────────

    pub async fn create_project(&self, name: &str, token: &str) -> Result<Project, ApiError> {
        let response = self
            .http
            .post(self.url("/projects"))
            .bearer_auth(token)
            .json(&CreateProjectRequest { name })
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::parse(response).await
    }

    pub async fn list_projects(&self, token: &str) -> Result<Vec<Project>, ApiError> {
        let response = self
            .http
            .get(self.url("/projects"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::parse(response).await
    }

    pub async fn get_project(&self, project_id: &str, token: &str) -> Result<Project, ApiError> {
        let response = self
            .http
            .get(self.url(&format!("/projects/{project_id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::parse(response).await
    }

    pub async fn delete_project(&self, project_id: &str, token: &str) -> Result<(), ApiError> {
        let response = self
            .http
            .delete(self.url(&format!("/projects/{project_id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::check_status(&response)?;
        Ok(())
    }

    // ─── Diagrams ─────────────────────────────────────────────────────

    pub async fn create_diagram(
        &self,
        project_id: &str,
        data: &DiagramData,
        token: &str,
    ) -> Result<ApiDiagram, ApiError> {
        let response = self
            .http
            .post(self.url("/diagrams"))
            .bearer_auth(token)
            .json(&CreateDiagramRequest {
                project_id,
                diagram_data: data,
            })
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::parse(response).await
    }

    pub async fn list_project_diagrams(
        &self,
        project_id: &str,
        token: &str,
    ) -> Result<Vec<ApiDiagram>, ApiError> {
        let response = self
            .http
            .get(self.url(&format!("/projects/{project_id}/diagrams")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::parse(response).await
    }

    pub async fn get_diagram(&self, diagram_id: &str, token: &str) -> Result<ApiDiagram, ApiError> {
        let response = self
            .http
            .get(self.url(&format!("/diagrams/{diagram_id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::parse(response).await
    }

    pub async fn update_diagram(
        &self,
        diagram_id: &str,
        data: &DiagramData,
        token: &str,
    ) -> Result<ApiDiagram, ApiError> {
        let response = self
            .http
            .put(self.url(&format!("/diagrams/{diagram_id}")))
            .bearer_auth(token)
            .json(&UpdateDiagramRequest { diagram_data: data })
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::parse(response).await
    }

    pub async fn delete_diagram(&self, diagram_id: &str, token: &str) -> Result<(), ApiError> {
        let response = self
            .http
            .delete(self.url(&format!("/diagrams/{diagram_id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::check_status(&response)?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn check_status(response: &reqwest::Response) -> Result<(), ApiError> {
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(ApiError::AuthExpired),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound(response.url().path().to_string())),
            StatusCode::UNPROCESSABLE_ENTITY => {
                Err(ApiError::ValidationFailed(response.url().path().to_string()))
            }
            s => Err(ApiError::Network(format!("unexpected status {s}"))),
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        Self::check_status(&response)?;
        response
            .json()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))
    }
}

/// [`DiagramBackend`] over the REST client.
///
/// Holds the bearer credential; a 401 clears it so callers observe
/// `AuthExpired` until re-login.
pub struct RestBackend {
    client: RestClient,
    token: RwLock<Option<String>>,
}

impl RestBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            client: RestClient::new(base_url)?,
            token: RwLock::new(None),
        })
    }

    /// Authenticate and store the bearer credential.
    pub async fn login(&self, email: &str, password: &str) -> Result<User, ApiError> {
        let auth = self
            .client
            .login(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .await?;
        let user = self.client.me(&auth.access_token).await?;
        *self.token.write().await = Some(auth.access_token);
        Ok(user)
    }

    /// The stored credential, or `AuthExpired` when absent.
    async fn credential(&self) -> Result<String, ApiError> {
        self.token
            .read()
            .await
            .clone()
            .ok_or(ApiError::AuthExpired)
    }

    async fn handle_auth<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
        if matches!(result, Err(ApiError::AuthExpired)) {
            *self.token.write().await = None;
        }
        result
    }

    /// Direct access to the underlying client.
    pub fn client(&self) -> &RestClient {
        &self.client
    }
}

#[async_trait]
impl DiagramBackend for RestBackend {
    async fn load_diagram(&self, id: &str) -> Result<Diagram, ApiError> {
        let token = self.credential().await?;
        let result = self.client.get_diagram(id, &token).await;
        self.handle_auth(result).await.map(Diagram::from)
    }

    async fn save_diagram(&self, id: &str, data: &DiagramData) -> Result<u64, ApiError> {
        let token = self.credential().await?;
        let result = self.client.update_diagram(id, data, &token).await;
        self.handle_auth(result).await.map(|d| d.version)
    }
}
