//! JSON attendance reports built from stored records.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rollcall_core::{AttendanceRecord, AttendanceStatus, Day, Month, Student};
use serde::Serialize;

use crate::error::AttendanceError;
use crate::store::{Store, StudentFilter};

/// One record joined with the student's display fields.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentMark {
    pub reg_no: String,
    pub name: String,
    pub room_no: String,
    pub dept: String,
    pub time: Option<DateTime<Utc>>,
    pub marked_by: String,
}

impl StudentMark {
    fn new(record: &AttendanceRecord, student: Option<&Student>) -> Self {
        Self {
            reg_no: record.student_id.clone(),
            // Records outlive deleted students.
            name: student.map_or_else(|| "Unknown".to_string(), |s| s.name.clone()),
            room_no: student.map(|s| s.room_no.clone()).unwrap_or_default(),
            dept: student.map(|s| s.dept.clone()).unwrap_or_default(),
            time: record.time,
            marked_by: record.marked_by.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyReport {
    pub date: Day,
    pub finalized: bool,
    pub finalized_at: Option<DateTime<Utc>>,
    pub finalized_by: Option<String>,
    pub present: Vec<StudentMark>,
    pub absent: Vec<StudentMark>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DayTally {
    pub present: usize,
    pub absent: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyReport {
    pub month: String,
    pub by_date: BTreeMap<Day, DayTally>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentHistory {
    pub student: Student,
    pub month: Option<String>,
    pub present_days: usize,
    pub absent_days: usize,
    pub records: Vec<AttendanceRecord>,
}

async fn roster(store: &Store) -> Result<HashMap<String, Student>, AttendanceError> {
    Ok(store
        .list_students(&StudentFilter::default())
        .await?
        .into_iter()
        .map(|s| (s.reg_no.clone(), s))
        .collect())
}

pub async fn daily(
    store: &Store,
    date: Day,
    now: DateTime<Utc>,
) -> Result<DailyReport, AttendanceError> {
    let records = store.records_on(date).await?;
    let day = store.day(date).await?;
    let students = roster(store).await?;

    let (present, absent): (Vec<_>, Vec<_>) = records
        .iter()
        .partition(|r| r.status == AttendanceStatus::Present);
    let mark = |r: &&AttendanceRecord| StudentMark::new(r, students.get(&r.student_id));

    Ok(DailyReport {
        date,
        finalized: day.as_ref().is_some_and(|d| d.finalized),
        finalized_at: day.as_ref().and_then(|d| d.finalized_at),
        finalized_by: day.and_then(|d| d.finalized_by),
        present: present.iter().map(mark).collect(),
        absent: absent.iter().map(mark).collect(),
        generated_at: now,
    })
}

pub async fn monthly(
    store: &Store,
    month: Month,
    now: DateTime<Utc>,
) -> Result<MonthlyReport, AttendanceError> {
    let mut by_date: BTreeMap<Day, DayTally> = BTreeMap::new();
    for record in store.records_in_month(month).await? {
        let tally = by_date.entry(record.date).or_default();
        match record.status {
            AttendanceStatus::Present => tally.present += 1,
            AttendanceStatus::Absent => tally.absent += 1,
        }
    }
    Ok(MonthlyReport {
        month: month.to_string(),
        by_date,
        generated_at: now,
    })
}

pub async fn history(
    store: &Store,
    reg_no: &str,
    month: Option<Month>,
) -> Result<StudentHistory, AttendanceError> {
    let student = store
        .get_student(reg_no)
        .await?
        .ok_or_else(|| AttendanceError::NotFound(reg_no.to_string()))?;
    let records = store.records_for_student(reg_no, month).await?;
    let present_days = records
        .iter()
        .filter(|r| r.status == AttendanceStatus::Present)
        .count();
    Ok(StudentHistory {
        student,
        month: month.map(|m| m.to_string()),
        present_days,
        absent_days: records.len() - present_days,
        records,
    })
}
