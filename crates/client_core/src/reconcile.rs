//! Present/absent view derived from the roster and today's records.
//!
//! Everything here is pure: the dashboard re-fetches both inputs and derives
//! the whole view again on every refresh.

use std::{collections::HashSet, fmt};

use chrono::{DateTime, TimeZone, Utc};
use shared::domain::{AttendanceRecord, AttendanceStatus, Department, Student, StudentId};

/// Rendered in place of a timestamp on absent rows.
pub const ABSENT_SENTINEL: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowTimestamp {
    Present(DateTime<Utc>),
    Absent,
}

impl RowTimestamp {
    /// `h:mm AM/PM` in the given zone, or the absent sentinel.
    pub fn display_in<Tz>(&self, zone: &Tz) -> String
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        match self {
            RowTimestamp::Present(at) => format_clock(&at.with_timezone(zone)),
            RowTimestamp::Absent => ABSENT_SENTINEL.to_string(),
        }
    }
}

impl fmt::Display for RowTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_in(&Utc))
    }
}

pub fn format_clock<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    at.format("%-I:%M %p").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRow {
    /// Display position only; not an identity.
    pub seq: usize,
    pub student_id: StudentId,
    pub name: String,
    /// Missing when a record references a student the roster does not know.
    pub roll_no: Option<String>,
    pub department: Option<Department>,
    pub timestamp: RowTimestamp,
    pub status: AttendanceStatus,
}

impl AttendanceRow {
    pub fn is_present(&self) -> bool {
        self.status == AttendanceStatus::Present
    }
}

/// Present rows in record order, then one absent row per roster student with
/// no record today, numbered from 1 across both.
pub fn reconcile(roster: &[Student], records: &[AttendanceRecord]) -> Vec<AttendanceRow> {
    let present_ids: HashSet<StudentId> = records.iter().map(|record| record.student_id).collect();

    let present = records.iter().map(|record| {
        let student = roster.iter().find(|student| student.id == record.student_id);
        AttendanceRow {
            seq: 0,
            student_id: record.student_id,
            name: record.student_name.clone(),
            roll_no: student.map(|s| s.roll_no.clone()),
            department: student.map(|s| s.department.clone()),
            timestamp: RowTimestamp::Present(record.timestamp),
            status: AttendanceStatus::Present,
        }
    });

    let absent = roster
        .iter()
        .filter(|student| !present_ids.contains(&student.id))
        .map(|student| AttendanceRow {
            seq: 0,
            student_id: student.id,
            name: student.name.clone(),
            roll_no: Some(student.roll_no.clone()),
            department: Some(student.department.clone()),
            timestamp: RowTimestamp::Absent,
            status: AttendanceStatus::Absent,
        });

    present
        .chain(absent)
        .enumerate()
        .map(|(index, row)| AttendanceRow {
            seq: index + 1,
            ..row
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttendanceSummary {
    pub total_students: usize,
    pub present_today: usize,
    /// Whole percent, 0 for an empty roster.
    pub rate_percent: u32,
}

impl AttendanceSummary {
    pub fn compute(roster: &[Student], records: &[AttendanceRecord]) -> Self {
        let total_students = roster.len();
        let present_today = records.len();
        let rate_percent = if total_students == 0 {
            0
        } else {
            (present_today as f64 / total_students as f64 * 100.0).round() as u32
        };
        Self {
            total_students,
            present_today,
            rate_percent,
        }
    }
}
