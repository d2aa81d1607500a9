use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{AttendanceRecord, CardTag, NewStudent, Student},
    error::ErrorBody,
    protocol::{Ack, CaptureImageRequest, CreateStudentResponse},
};
use tracing::debug;

use crate::{endpoint::Endpoint, error::RequestError};

/// Upper bound on one REST call, body included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// REST surface of the collaborator. Screens and the binding workflow only
/// talk to the backend through this seam.
#[async_trait]
pub trait KioskApi: Send + Sync {
    async fn list_students(&self) -> Result<Vec<Student>, RequestError>;
    async fn create_student(&self, student: &NewStudent) -> Result<Student, RequestError>;
    async fn today_attendance(&self) -> Result<Vec<AttendanceRecord>, RequestError>;
    async fn unassigned_cards(&self) -> Result<Vec<CardTag>, RequestError>;
    async fn start_camera(&self) -> Result<(), RequestError>;
    async fn stop_camera(&self) -> Result<(), RequestError>;
    /// Asks the collaborator to persist the current frame for `card`. Success
    /// only means the request was accepted; the outcome arrives on the live
    /// channel.
    async fn capture_image(&self, card: &CardTag) -> Result<(), RequestError>;
}

pub struct HttpKioskApi {
    http: Client,
    endpoint: Endpoint,
}

impl HttpKioskApi {
    pub fn new(endpoint: Endpoint) -> Result<Self, RequestError> {
        Self::with_timeout(endpoint, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: Endpoint, timeout: Duration) -> Result<Self, RequestError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, endpoint))
    }

    pub fn with_client(http: Client, endpoint: Endpoint) -> Self {
        Self { http, endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        let url = self.endpoint.rest(path);
        debug!(%url, "GET");
        let response = self.http.get(url).send().await?;
        read_json(response).await
    }

    async fn post_ack(&self, path: &str) -> Result<(), RequestError> {
        let url = self.endpoint.rest(path);
        debug!(%url, "POST");
        let response = self.http.post(url).send().await?;
        let _: Ack = read_json_or_default(response).await?;
        Ok(())
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, RequestError> {
    let body = read_body(response).await?;
    serde_json::from_slice(&body).map_err(|err| RequestError::Decode(err.to_string()))
}

async fn read_json_or_default<T: DeserializeOwned + Default>(
    response: Response,
) -> Result<T, RequestError> {
    let body = read_body(response).await?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&body).map_err(|err| RequestError::Decode(err.to_string()))
}

async fn read_body(response: Response) -> Result<Vec<u8>, RequestError> {
    let status = response.status();
    let body = response.bytes().await?;
    if status.is_success() {
        return Ok(body.to_vec());
    }

    let message = serde_json::from_slice::<ErrorBody>(&body)
        .map(|body| body.error)
        .unwrap_or_else(|_| {
            status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
        });
    Err(RequestError::rejected(status.as_u16(), message))
}

/// The pool may hold numbers, strings or nulls depending on how the tag
/// column was populated; blanks are dropped and duplicates collapse.
fn parse_card_pool(raw: Vec<serde_json::Value>) -> Vec<CardTag> {
    let mut pool: Vec<CardTag> = Vec::with_capacity(raw.len());
    for value in raw {
        let tag = match value {
            serde_json::Value::String(text) => CardTag::new(text),
            serde_json::Value::Number(number) => CardTag::new(number.to_string()),
            _ => None,
        };
        if let Some(tag) = tag {
            if !pool.contains(&tag) {
                pool.push(tag);
            }
        }
    }
    pool
}

#[async_trait]
impl KioskApi for HttpKioskApi {
    async fn list_students(&self) -> Result<Vec<Student>, RequestError> {
        self.get_json("/api/students").await
    }

    async fn create_student(&self, student: &NewStudent) -> Result<Student, RequestError> {
        let response = self
            .http
            .post(self.endpoint.rest("/api/students"))
            .json(student)
            .send()
            .await?;
        let created: CreateStudentResponse = read_json(response).await?;
        Ok(created.student)
    }

    async fn today_attendance(&self) -> Result<Vec<AttendanceRecord>, RequestError> {
        self.get_json("/api/attendance/today").await
    }

    async fn unassigned_cards(&self) -> Result<Vec<CardTag>, RequestError> {
        let raw: Vec<serde_json::Value> = self.get_json("/api/unassigned-cards").await?;
        Ok(parse_card_pool(raw))
    }

    async fn start_camera(&self) -> Result<(), RequestError> {
        self.post_ack("/api/start-camera").await
    }

    async fn stop_camera(&self) -> Result<(), RequestError> {
        self.post_ack("/api/stop-camera").await
    }

    async fn capture_image(&self, card: &CardTag) -> Result<(), RequestError> {
        let response = self
            .http
            .post(self.endpoint.rest("/api/capture-image"))
            .json(&CaptureImageRequest {
                card_id: card.clone(),
            })
            .send()
            .await?;
        let _: Ack = read_json_or_default(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
