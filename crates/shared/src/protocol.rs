use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{deserialize_instant, CardTag, Student, StudentId};

/// One preview frame pushed while a camera session is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraFrame {
    /// Base64 encoded JPEG.
    pub image: String,
}

impl CameraFrame {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        let data = match self.image.split_once("base64,") {
            Some((_, data)) => data,
            None => self.image.as_str(),
        };
        STANDARD.decode(data.trim())
    }

    pub fn data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", self.image)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCaptured {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_id: Option<CardTag>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraError {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceMarked {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<StudentId>,
    pub name: String,
    #[serde(deserialize_with = "deserialize_instant")]
    pub timestamp: DateTime<Utc>,
}

/// Server-originated events carried by the live channel, one per Socket.IO
/// event emitted by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    CameraFrame(CameraFrame),
    ImageCaptured(ImageCaptured),
    CameraError(CameraError),
    AttendanceMarked(AttendanceMarked),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::CameraFrame(_) => "camera_frame",
            ServerEvent::ImageCaptured(_) => "image_captured",
            ServerEvent::CameraError(_) => "camera_error",
            ServerEvent::AttendanceMarked(_) => "attendance_marked",
        }
    }

    /// Decodes the first argument of the event `name`. `Ok(None)` for events
    /// the console does not handle.
    pub fn from_named(name: &str, payload: Value) -> Result<Option<Self>, serde_json::Error> {
        let event = match name {
            "camera_frame" => ServerEvent::CameraFrame(serde_json::from_value(payload)?),
            "image_captured" => ServerEvent::ImageCaptured(serde_json::from_value(payload)?),
            "camera_error" => ServerEvent::CameraError(serde_json::from_value(payload)?),
            "attendance_marked" => ServerEvent::AttendanceMarked(serde_json::from_value(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureImageRequest {
    pub card_id: CardTag,
}

/// Acknowledgement body of the camera control routes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStudentResponse {
    #[serde(default)]
    pub message: Option<String>,
    pub student: Student,
}
