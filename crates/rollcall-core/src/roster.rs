//! Roster and attendance records, plus the `YYYY-MM-DD` / `YYYY-MM` date
//! boundary formats.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::types::Embedding;

#[derive(Error, Debug, PartialEq)]
pub enum RosterError {
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid month {0:?}, expected YYYY-MM")]
    InvalidMonth(String),
    #[error("invalid leave status {0:?}")]
    InvalidLeaveStatus(String),
    #[error("invalid attendance status {0:?}")]
    InvalidAttendanceStatus(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid category {0:?}")]
    InvalidCategory(String),
    #[error("invalid college {0:?}")]
    InvalidCollege(String),
}

/// Admission categories a student may be enrolled under.
pub const CATEGORIES: &[&str] = &[
    "7.5% Quota",
    "Counselling",
    "Sports Quota",
    "Management",
    "College",
];

/// Colleges whose students the hostel houses.
pub const COLLEGES: &[&str] = &["HIT", "HICET", "ARC"];

/// Trim and uppercase a registration number.
pub fn normalize_reg_no(raw: &str) -> String {
    raw.trim().to_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveStatus {
    #[default]
    None,
    OnLeave,
    Medical,
}

impl LeaveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveStatus::None => "none",
            LeaveStatus::OnLeave => "on_leave",
            LeaveStatus::Medical => "medical",
        }
    }
}

impl FromStr for LeaveStatus {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(LeaveStatus::None),
            "on_leave" => Ok(LeaveStatus::OnLeave),
            "medical" => Ok(LeaveStatus::Medical),
            other => Err(RosterError::InvalidLeaveStatus(other.to_string())),
        }
    }
}

/// An enrolled hostel student.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub reg_no: String,
    pub name: String,
    pub room_no: String,
    pub dept: String,
    pub category: String,
    pub college: String,
    pub face_registered: bool,
    /// Not exposed over the API.
    #[serde(skip)]
    pub face_embedding: Option<Embedding>,
    pub leave_status: LeaveStatus,
    pub leave_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Student {
    /// On leave or medical leave that has not expired at `now`.
    /// An unset `leave_until` means open-ended leave.
    pub fn on_active_leave(&self, now: DateTime<Utc>) -> bool {
        match self.leave_status {
            LeaveStatus::None => false,
            LeaveStatus::OnLeave | LeaveStatus::Medical => {
                self.leave_until.map_or(true, |until| until >= now)
            }
        }
    }

    /// Registered with a usable embedding.
    pub fn is_match_candidate(&self) -> bool {
        self.face_registered && self.face_embedding.as_ref().is_some_and(|e| !e.is_empty())
    }
}

/// Fields supplied at enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStudent {
    #[serde(alias = "studentId")]
    pub reg_no: String,
    pub name: String,
    #[serde(alias = "room")]
    pub room_no: String,
    #[serde(alias = "department")]
    pub dept: String,
    pub category: String,
    pub college: String,
}

impl NewStudent {
    /// Trim every field, normalize the regNo, reject blanks and unknown
    /// categories or colleges.
    pub fn validated(self) -> Result<Self, RosterError> {
        let reg_no = normalize_reg_no(&self.reg_no);
        if reg_no.is_empty() {
            return Err(RosterError::MissingField("regNo"));
        }
        Ok(Self {
            reg_no,
            name: required(self.name, "name")?,
            room_no: required(self.room_no, "roomNo")?,
            dept: required(self.dept, "dept")?,
            category: category(self.category)?,
            college: college(self.college)?,
        })
    }
}

/// An edit to a student's display fields. Absent fields are left alone;
/// registration number, face and leave state cannot be changed here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentUpdate {
    pub name: Option<String>,
    #[serde(alias = "room")]
    pub room_no: Option<String>,
    #[serde(alias = "department")]
    pub dept: Option<String>,
    pub category: Option<String>,
    pub college: Option<String>,
}

impl StudentUpdate {
    pub fn validated(self) -> Result<Self, RosterError> {
        Ok(Self {
            name: self.name.map(|v| required(v, "name")).transpose()?,
            room_no: self.room_no.map(|v| required(v, "roomNo")).transpose()?,
            dept: self.dept.map(|v| required(v, "dept")).transpose()?,
            category: self.category.map(category).transpose()?,
            college: self.college.map(college).transpose()?,
        })
    }

    pub fn apply(self, student: &mut Student) {
        if let Some(name) = self.name {
            student.name = name;
        }
        if let Some(room_no) = self.room_no {
            student.room_no = room_no;
        }
        if let Some(dept) = self.dept {
            student.dept = dept;
        }
        if let Some(category) = self.category {
            student.category = category;
        }
        if let Some(college) = self.college {
            student.college = college;
        }
    }
}

fn required(value: String, field: &'static str) -> Result<String, RosterError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(RosterError::MissingField(field))
    } else {
        Ok(trimmed.to_string())
    }
}

fn category(value: String) -> Result<String, RosterError> {
    let value = required(value, "category")?;
    if CATEGORIES.contains(&value.as_str()) {
        Ok(value)
    } else {
        Err(RosterError::InvalidCategory(value))
    }
}

fn college(value: String) -> Result<String, RosterError> {
    let value = required(value, "college")?;
    if COLLEGES.contains(&value.as_str()) {
        Ok(value)
    } else {
        Err(RosterError::InvalidCollege(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Absent => "Absent",
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Present" => Ok(AttendanceStatus::Present),
            "Absent" => Ok(AttendanceStatus::Absent),
            other => Err(RosterError::InvalidAttendanceStatus(other.to_string())),
        }
    }
}

/// One student's mark for one date. (student_id, date) is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub student_id: String,
    pub date: Day,
    pub status: AttendanceStatus,
    /// Set for Present marks only.
    pub time: Option<DateTime<Utc>>,
    pub marked_by: String,
}

/// Per-date control row. `finalized` never goes back to false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceDay {
    pub date: Day,
    pub finalized: bool,
    pub finalized_at: Option<DateTime<Utc>>,
    pub finalized_by: Option<String>,
}

/// A calendar date in `YYYY-MM-DD` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Day(pub NaiveDate);

impl Day {
    /// UTC calendar date of `now`.
    pub fn of(now: DateTime<Utc>) -> Self {
        Day(now.date_naive())
    }

    pub fn month(&self) -> Month {
        Month {
            year: self.0.year(),
            month: self.0.month(),
        }
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for Day {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // chrono accepts unpadded fields; the boundary format does not.
        if s.len() != 10 {
            return Err(RosterError::InvalidDate(s.to_string()));
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Day)
            .map_err(|_| RosterError::InvalidDate(s.to_string()))
    }
}

impl Serialize for Day {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Day {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A calendar month in `YYYY-MM` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Month {
    pub year: i32,
    pub month: u32,
}

impl Month {
    pub fn first_day(&self) -> Day {
        // Validated on construction, so day 1 always exists.
        Day(NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default())
    }

    pub fn last_day(&self) -> Day {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        let next = NaiveDate::from_ymd_opt(y, m, 1).unwrap_or_default();
        Day(next.pred_opt().unwrap_or(next))
    }

    pub fn contains(&self, day: Day) -> bool {
        day.0.year() == self.year && day.0.month() == self.month
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Month {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || RosterError::InvalidMonth(s.to_string());
        let (y, m) = s.split_once('-').ok_or_else(err)?;
        if y.len() != 4 || m.len() != 2 {
            return Err(err());
        }
        let year: i32 = y.parse().map_err(|_| err())?;
        let month: u32 = m.parse().map_err(|_| err())?;
        if NaiveDate::from_ymd_opt(year, month, 1).is_none() {
            return Err(err());
        }
        Ok(Month { year, month })
    }
}
