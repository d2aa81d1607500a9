use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::*;
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone};
use shared::{
    domain::{
        AttendanceId, AttendanceRecord, AttendanceStatus, Batch, BloodGroup, CardTag, Department,
        NewStudent, Student, StudentId,
    },
    error::ErrorCode,
};

use crate::error::ErrorCategory;

#[derive(Default)]
struct CountingApi {
    roster_fetches: AtomicUsize,
    failing: AtomicBool,
}

fn student(id: i64, name: &str) -> Student {
    Student {
        id: StudentId(id),
        name: name.to_string(),
        roll_no: format!("R{id}"),
        date_of_birth: NaiveDate::from_ymd_opt(2003, 5, 9).expect("date"),
        blood_group: BloodGroup::BPositive,
        phone: "9123456780".to_string(),
        department: Department::AiDs,
        batch: Batch::Y2023,
        card_id: None,
    }
}

#[async_trait]
impl KioskApi for CountingApi {
    async fn list_students(&self) -> Result<Vec<Student>, RequestError> {
        self.roster_fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RequestError::Rejected {
                status: 503,
                code: ErrorCode::Unavailable,
                message: "database offline".to_string(),
            });
        }
        Ok(vec![student(1, "Asha"), student(2, "Ravi")])
    }

    async fn create_student(&self, _student: &NewStudent) -> Result<Student, RequestError> {
        Err(RequestError::rejected(405, "not supported"))
    }

    async fn today_attendance(&self) -> Result<Vec<AttendanceRecord>, RequestError> {
        Ok(vec![AttendanceRecord {
            id: AttendanceId(1),
            student_id: StudentId(2),
            student_name: "Ravi".to_string(),
            timestamp: Utc
                .with_ymd_and_hms(2024, 3, 1, 8, 55, 0)
                .single()
                .expect("instant"),
            status: AttendanceStatus::Present,
        }])
    }

    async fn unassigned_cards(&self) -> Result<Vec<CardTag>, RequestError> {
        Ok(Vec::new())
    }

    async fn start_camera(&self) -> Result<(), RequestError> {
        Ok(())
    }

    async fn stop_camera(&self) -> Result<(), RequestError> {
        Ok(())
    }

    async fn capture_image(&self, _card: &CardTag) -> Result<(), RequestError> {
        Ok(())
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn load_dashboard_reconciles_and_summarises() {
    let api = CountingApi::default();

    let view = load_dashboard(&api).await.expect("view");

    let names: Vec<&str> = view.rows.iter().map(|row| row.name.as_str()).collect();
    assert_eq!(names, vec!["Ravi", "Asha"]);
    assert_eq!(view.summary.total_students, 2);
    assert_eq!(view.summary.present_today, 1);
    assert_eq!(view.summary.rate_percent, 50);
}

#[tokio::test(start_paused = true)]
async fn refreshes_immediately_then_every_interval() {
    let api = Arc::new(CountingApi::default());
    let poller = DashboardPoller::spawn(api.clone(), DEFAULT_REFRESH_INTERVAL);

    settle().await;
    assert_eq!(poller.snapshot().refreshes, 1);
    assert!(poller.snapshot().view.is_some());

    tokio::time::advance(Duration::from_secs(29)).await;
    settle().await;
    assert_eq!(api.roster_fetches.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(api.roster_fetches.load(Ordering::SeqCst), 2);
    assert_eq!(poller.snapshot().refreshes, 2);
}

#[tokio::test(start_paused = true)]
async fn zero_interval_is_raised_to_the_minimum() {
    let api = Arc::new(CountingApi::default());
    let poller = DashboardPoller::spawn(api.clone(), Duration::ZERO);

    settle().await;
    assert_eq!(poller.snapshot().refreshes, 1);

    tokio::time::advance(MIN_REFRESH_INTERVAL / 2).await;
    settle().await;
    assert_eq!(api.roster_fetches.load(Ordering::SeqCst), 1);

    tokio::time::advance(MIN_REFRESH_INTERVAL / 2).await;
    settle().await;
    assert_eq!(api.roster_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_keeps_last_view_and_recovers() {
    let api = Arc::new(CountingApi::default());
    let poller = DashboardPoller::spawn(api.clone(), DEFAULT_REFRESH_INTERVAL);
    settle().await;
    let first_view = poller.snapshot().view.expect("initial view");

    api.failing.store(true, Ordering::SeqCst);
    tokio::time::advance(DEFAULT_REFRESH_INTERVAL).await;
    settle().await;

    let snapshot = poller.snapshot();
    let error = snapshot.error.expect("refresh error");
    assert_eq!(error.category(), ErrorCategory::DataFetch);
    assert!(error.message().contains("database offline"));
    assert_eq!(snapshot.view.map(|view| view.rows), Some(first_view.rows));

    api.failing.store(false, Ordering::SeqCst);
    tokio::time::advance(DEFAULT_REFRESH_INTERVAL).await;
    settle().await;
    assert!(poller.snapshot().error.is_none());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_poller_cancels_the_timer() {
    let api = Arc::new(CountingApi::default());
    let poller = DashboardPoller::spawn(api.clone(), DEFAULT_REFRESH_INTERVAL);
    settle().await;
    drop(poller);

    tokio::time::advance(DEFAULT_REFRESH_INTERVAL * 3).await;
    settle().await;
    assert_eq!(api.roster_fetches.load(Ordering::SeqCst), 1);
}
