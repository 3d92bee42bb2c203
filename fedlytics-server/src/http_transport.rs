// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Client-side transport that talks to a remote coordinator over HTTP/JSON.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use fedlytics_coordinator::{
    CoordinatorTransport, EncryptedUpdate, FederatedError, FederatedResult, FederationStatus,
    RegistrationReceipt, UpdateReceipt,
};
use fedlytics_core::{ModelSnapshot, PublicMaterial};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::api::{ModelResponse, RegisterRequest, RegisterResponse, UpdateRequest};

/// Default per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`CoordinatorTransport`] over the coordinator's HTTP API
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> FederatedResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FederatedError::Transport(e.to_string()))?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

fn transport_error(e: reqwest::Error) -> FederatedError {
    FederatedError::Transport(e.to_string())
}

/// Server errors are transient; client errors are not worth retrying.
async fn error_from_response(response: Response) -> FederatedError {
    let status = response.status();
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };

    if status.is_server_error() {
        FederatedError::Transport(format!("{}: {}", status, message))
    } else if status == StatusCode::NOT_FOUND {
        FederatedError::UnknownClient(message)
    } else {
        FederatedError::InvalidParameter(message)
    }
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> FederatedResult<T> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    response
        .json::<T>()
        .await
        .map_err(|e| FederatedError::Serialization(e.to_string()))
}

#[async_trait]
impl CoordinatorTransport for HttpTransport {
    async fn register(&self, client_id: &str, data_size: usize) -> FederatedResult<RegistrationReceipt> {
        let response = self
            .client
            .post(self.url("/register"))
            .json(&RegisterRequest {
                client_id: client_id.to_string(),
                data_size,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let body: RegisterResponse = parse_json(response).await?;

        let key_bytes = STANDARD
            .decode(body.fhe_public_key.as_bytes())
            .map_err(|e| FederatedError::Serialization(format!("fhe_public_key: {}", e)))?;
        let public_material = PublicMaterial::from_bytes(&key_bytes)?;

        Ok(RegistrationReceipt {
            client_id: body.client_id,
            newly_registered: body.status == "registered",
            public_material,
        })
    }

    async fn download_global_model(&self) -> FederatedResult<ModelSnapshot> {
        let response = self
            .client
            .get(self.url("/model"))
            .send()
            .await
            .map_err(transport_error)?;
        let body: ModelResponse = parse_json(response).await?;

        let mut model = body.model;
        model.round_id = body.round_id;
        Ok(model)
    }

    async fn submit_update(&self, update: EncryptedUpdate) -> FederatedResult<UpdateReceipt> {
        let response = self
            .client
            .post(self.url("/update"))
            .json(&UpdateRequest::from(update))
            .send()
            .await
            .map_err(transport_error)?;

        // 409 carries a rejection receipt rather than an error body
        if response.status() == StatusCode::CONFLICT {
            return response
                .json::<UpdateReceipt>()
                .await
                .map_err(|e| FederatedError::Serialization(e.to_string()));
        }
        parse_json(response).await
    }

    async fn status(&self) -> FederatedResult<FederationStatus> {
        let response = self
            .client
            .get(self.url("/status"))
            .send()
            .await
            .map_err(transport_error)?;
        parse_json(response).await
    }
}
