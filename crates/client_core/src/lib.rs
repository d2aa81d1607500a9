use std::{sync::Arc, time::Duration};

use shared::{
    domain::{Student, StudentForm},
    error::ErrorCode,
};
use tracing::info;

pub mod api;
pub mod binding;
pub mod dashboard;
pub mod endpoint;
pub mod error;
pub mod live_channel;
pub mod live_feed;
pub mod reconcile;
pub mod socket_io;

pub use api::{HttpKioskApi, KioskApi};
pub use binding::{BindingController, BindingPhase, BindingSnapshot, DispatchError, Rejected};
pub use dashboard::{DashboardPoller, DashboardSnapshot, DashboardView};
pub use endpoint::Endpoint;
pub use error::{ConsoleError, ErrorCategory, RequestError};
pub use live_channel::{ChannelStatus, LiveChannel, ReconnectPolicy};
pub use live_feed::{AttendanceMonitor, FeedSnapshot};

/// Entry point for one kiosk collaborator. Each screen mounts its own
/// components from here and tears them down by dropping them.
#[derive(Clone)]
pub struct KioskClient {
    endpoint: Endpoint,
    api: Arc<dyn KioskApi>,
    reconnect: ReconnectPolicy,
}

impl KioskClient {
    pub fn new(endpoint: Endpoint, reconnect: ReconnectPolicy) -> Result<Self, RequestError> {
        let api = Arc::new(HttpKioskApi::new(endpoint.clone())?);
        Ok(Self::with_api(endpoint, api, reconnect))
    }

    pub fn with_api(endpoint: Endpoint, api: Arc<dyn KioskApi>, reconnect: ReconnectPolicy) -> Self {
        Self {
            endpoint,
            api,
            reconnect,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn api(&self) -> Arc<dyn KioskApi> {
        Arc::clone(&self.api)
    }

    pub fn open_channel(&self) -> LiveChannel {
        LiveChannel::open(&self.endpoint, self.reconnect)
    }

    /// Binding screen: its own live channel plus the controller driving it.
    pub fn mount_binding(&self) -> (LiveChannel, BindingController) {
        let channel = self.open_channel();
        let controller = BindingController::mount(self.api(), &channel);
        (channel, controller)
    }

    pub fn mount_monitor(&self) -> (LiveChannel, AttendanceMonitor) {
        let channel = self.open_channel();
        let monitor = AttendanceMonitor::mount(&channel);
        (channel, monitor)
    }

    pub fn mount_dashboard(&self, every: Duration) -> DashboardPoller {
        DashboardPoller::spawn(self.api(), every)
    }

    /// Validates the form locally and submits it. The form is only borrowed so
    /// the caller keeps the entered values for correction.
    pub async fn register(&self, form: &StudentForm) -> Result<Student, ConsoleError> {
        let new_student = form
            .validate()
            .map_err(|errors| ConsoleError::validation(&errors))?;
        let student = self
            .api
            .create_student(&new_student)
            .await
            .map_err(|err| match &err {
                RequestError::Rejected {
                    code: ErrorCode::Validation | ErrorCode::Conflict,
                    message,
                    ..
                } => ConsoleError::new(ErrorCategory::Validation, message.clone()),
                _ => ConsoleError::data_fetch("Failed to add student", &err),
            })?;
        info!(student_id = student.id.0, roll_no = %student.roll_no, "student registered");
        Ok(student)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
