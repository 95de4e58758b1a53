//! SQLite persistence for students, attendance records and day rows.
//!
//! The (student_id, date) UNIQUE constraint and the finalized check inside
//! the write transaction are what keep concurrent scans and finalization
//! consistent; callers may pre-check, but the store has the last word.

use chrono::{DateTime, Utc};
use rollcall_core::roster::RosterError;
use rollcall_core::{
    AttendanceDay, AttendanceRecord, AttendanceStatus, Candidate, Day, Embedding, LeaveStatus,
    Month, NewStudent, Student, StudentUpdate,
};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS students (
    reg_no          TEXT PRIMARY KEY,
    id              TEXT NOT NULL UNIQUE,
    name            TEXT NOT NULL,
    room_no         TEXT NOT NULL,
    dept            TEXT NOT NULL,
    category        TEXT NOT NULL,
    college         TEXT NOT NULL,
    face_registered INTEGER NOT NULL DEFAULT 0,
    face_embedding  TEXT,
    leave_status    TEXT NOT NULL DEFAULT 'none',
    leave_until     TEXT,
    created_at      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    student_id  TEXT NOT NULL,
    date        TEXT NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('Present', 'Absent')),
    time        TEXT,
    marked_by   TEXT NOT NULL,
    UNIQUE (student_id, date)
);
CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance (date);
CREATE TABLE IF NOT EXISTS attendance_days (
    date         TEXT PRIMARY KEY,
    finalized    INTEGER NOT NULL DEFAULT 0,
    finalized_at TEXT,
    finalized_by TEXT
);
";

const STUDENT_COLUMNS: &str = "id, reg_no, name, room_no, dept, category, college, \
     face_registered, face_embedding, leave_status, leave_until, created_at";

const RECORD_COLUMNS: &str = "student_id, date, status, time, marked_by";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("embedding encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("register number {0} already exists")]
    DuplicateStudent(String),
    #[error("student {0} not found")]
    StudentNotFound(String),
    #[error("face already registered for {0}")]
    FaceAlreadyRegistered(String),
    #[error("attendance already marked for {student_id}")]
    AlreadyMarked {
        student_id: String,
        marked_at: Option<DateTime<Utc>>,
    },
    #[error("attendance for {0} is finalized")]
    DayFinalized(Day),
    #[error("attendance for {0} is already finalized")]
    AlreadyFinalized(Day),
}

/// Result of closing a day.
#[derive(Debug, Clone)]
pub struct FinalizeSummary {
    pub date: Day,
    pub finalized_at: DateTime<Utc>,
    /// regNos that received an Absent record.
    pub absent: Vec<String>,
}

/// Optional filters for listing students.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentFilter {
    pub face_registered: Option<bool>,
    pub dept: Option<String>,
    pub room_no: Option<String>,
    pub college: Option<String>,
    /// Case-insensitive substring of regNo or name.
    pub search: Option<String>,
}

impl StudentFilter {
    pub fn matches(&self, s: &Student) -> bool {
        let eq = |want: &Option<String>, have: &str| want.as_deref().map_or(true, |w| w == have);
        let search = self.search.as_deref().map(str::to_lowercase);
        self.face_registered.map_or(true, |f| f == s.face_registered)
            && eq(&self.dept, &s.dept)
            && eq(&self.room_no, &s.room_no)
            && eq(&self.college, &s.college)
            && search.map_or(true, |q| {
                s.reg_no.to_lowercase().contains(&q) || s.name.to_lowercase().contains(&q)
            })
    }
}

/// Clone-safe handle to the database thread.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    // --- students ---

    pub async fn insert_student(
        &self,
        new: NewStudent,
        now: DateTime<Utc>,
    ) -> Result<Student, StoreError> {
        let student = Student {
            id: uuid::Uuid::new_v4().to_string(),
            reg_no: new.reg_no,
            name: new.name,
            room_no: new.room_no,
            dept: new.dept,
            category: new.category,
            college: new.college,
            face_registered: false,
            face_embedding: None,
            leave_status: LeaveStatus::None,
            leave_until: None,
            created_at: now,
        };
        let row = student.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let result = conn.execute(
                    "INSERT INTO students (id, reg_no, name, room_no, dept, category, college, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        row.id,
                        row.reg_no,
                        row.name,
                        row.room_no,
                        row.dept,
                        row.category,
                        row.college,
                        row.created_at
                    ],
                );
                match result {
                    Ok(_) => Ok(true),
                    Err(e) if is_constraint_violation(&e) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if inserted {
            Ok(student)
        } else {
            Err(StoreError::DuplicateStudent(student.reg_no))
        }
    }

    pub async fn get_student(&self, reg_no: &str) -> Result<Option<Student>, StoreError> {
        let reg_no = reg_no.to_string();
        Ok(self
            .conn
            .call(move |conn| Ok(query_student(conn, &reg_no)?))
            .await?)
    }

    /// All students matching `filter`, sorted by name.
    pub async fn list_students(&self, filter: &StudentFilter) -> Result<Vec<Student>, StoreError> {
        let all = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {STUDENT_COLUMNS} FROM students ORDER BY name, reg_no"
                ))?;
                let rows = stmt
                    .query_map([], student_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(all.into_iter().filter(|s| filter.matches(s)).collect())
    }

    /// (total, face registered).
    pub async fn count_students(&self) -> Result<(usize, usize), StoreError> {
        Ok(self
            .conn
            .call(|conn| {
                let counts = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(face_registered), 0) FROM students",
                    [],
                    |row| Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as usize)),
                )?;
                Ok(counts)
            })
            .await?)
    }

    /// Returns false if no such student existed.
    pub async fn delete_student(&self, reg_no: &str) -> Result<bool, StoreError> {
        let reg_no = reg_no.to_string();
        let deleted = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM students WHERE reg_no = ?1", [reg_no])?))
            .await?;
        Ok(deleted > 0)
    }

    /// Edit display fields. Face and leave columns are not written.
    pub async fn update_student(
        &self,
        reg_no: &str,
        update: StudentUpdate,
    ) -> Result<Student, StoreError> {
        let key = reg_no.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                let Some(mut student) = query_student(conn, &key)? else {
                    return Ok(None);
                };
                update.apply(&mut student);
                conn.execute(
                    "UPDATE students SET name = ?1, room_no = ?2, dept = ?3, category = ?4, college = ?5
                     WHERE reg_no = ?6",
                    params![
                        student.name,
                        student.room_no,
                        student.dept,
                        student.category,
                        student.college,
                        key
                    ],
                )?;
                Ok(Some(student))
            })
            .await?;
        updated.ok_or_else(|| StoreError::StudentNotFound(reg_no.to_string()))
    }

    /// Set leave status; `leave_until` is cleared when the status is `none`.
    pub async fn set_leave(
        &self,
        reg_no: &str,
        status: LeaveStatus,
        until: Option<DateTime<Utc>>,
    ) -> Result<Student, StoreError> {
        let until = if status == LeaveStatus::None { None } else { until };
        let key = reg_no.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE students SET leave_status = ?1, leave_until = ?2 WHERE reg_no = ?3",
                    params![status.as_str(), until, key],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                Ok(query_student(conn, &key)?)
            })
            .await?;
        updated.ok_or_else(|| StoreError::StudentNotFound(reg_no.to_string()))
    }

    /// Store the face embedding. Only succeeds while the student is still
    /// unregistered; an existing embedding is never overwritten.
    pub async fn register_embedding(
        &self,
        reg_no: &str,
        embedding: &Embedding,
    ) -> Result<Student, StoreError> {
        let encoded = serde_json::to_string(&embedding.values)?;
        let key = reg_no.to_string();

        enum Outcome {
            Registered(Student),
            AlreadyRegistered,
            NotFound,
        }

        let outcome = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE students SET face_registered = 1, face_embedding = ?1
                     WHERE reg_no = ?2 AND face_registered = 0",
                    params![encoded, key],
                )?;
                let current = query_student(conn, &key)?;
                Ok(match (changed, current) {
                    (1, Some(student)) => Outcome::Registered(student),
                    (_, Some(_)) => Outcome::AlreadyRegistered,
                    (_, None) => Outcome::NotFound,
                })
            })
            .await?;

        match outcome {
            Outcome::Registered(student) => Ok(student),
            Outcome::AlreadyRegistered => Err(StoreError::FaceAlreadyRegistered(reg_no.to_string())),
            Outcome::NotFound => Err(StoreError::StudentNotFound(reg_no.to_string())),
        }
    }

    /// Registered students with a non-empty embedding, in enrollment order.
    pub async fn candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {STUDENT_COLUMNS} FROM students WHERE face_registered = 1 ORDER BY rowid"
                ))?;
                let students = stmt
                    .query_map([], student_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(students
                    .into_iter()
                    .filter(Student::is_match_candidate)
                    .filter_map(|s| {
                        s.face_embedding.map(|embedding| Candidate {
                            id: s.reg_no,
                            embedding,
                        })
                    })
                    .collect())
            })
            .await?)
    }

    // --- attendance ---

    pub async fn day(&self, date: Day) -> Result<Option<AttendanceDay>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| Ok(query_day(conn, date)?))
            .await?)
    }

    pub async fn record(
        &self,
        reg_no: &str,
        date: Day,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let key = reg_no.to_string();
        Ok(self
            .conn
            .call(move |conn| Ok(query_record(conn, &key, date)?))
            .await?)
    }

    /// Insert a Present record. Fails with `DayFinalized` if the day was
    /// finalized, or `AlreadyMarked` if any record already exists.
    pub async fn mark_present(
        &self,
        reg_no: &str,
        date: Day,
        time: DateTime<Utc>,
        operator: &str,
    ) -> Result<AttendanceRecord, StoreError> {
        let record = AttendanceRecord {
            student_id: reg_no.to_string(),
            date,
            status: AttendanceStatus::Present,
            time: Some(time),
            marked_by: operator.to_string(),
        };
        let row = record.clone();

        enum Outcome {
            Inserted,
            Finalized,
            Existing(Option<AttendanceRecord>),
        }

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if query_day(&tx, row.date)?.is_some_and(|d| d.finalized) {
                    return Ok(Outcome::Finalized);
                }
                let result = tx.execute(
                    "INSERT INTO attendance (student_id, date, status, time, marked_by)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        row.student_id,
                        row.date.to_string(),
                        row.status.as_str(),
                        row.time,
                        row.marked_by
                    ],
                );
                match result {
                    Ok(_) => {
                        tx.commit()?;
                        Ok(Outcome::Inserted)
                    }
                    Err(e) if is_constraint_violation(&e) => {
                        Ok(Outcome::Existing(query_record(&tx, &row.student_id, row.date)?))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        match outcome {
            Outcome::Inserted => Ok(record),
            Outcome::Finalized => Err(StoreError::DayFinalized(date)),
            Outcome::Existing(existing) => Err(StoreError::AlreadyMarked {
                student_id: record.student_id,
                marked_at: existing.and_then(|r| r.time),
            }),
        }
    }

    /// Close `date`: Absent for every registered student with no record and
    /// no active leave, then set the day finalized. One transaction.
    pub async fn finalize_day(
        &self,
        date: Day,
        now: DateTime<Utc>,
        operator: &str,
    ) -> Result<FinalizeSummary, StoreError> {
        let operator = operator.to_string();

        let absent = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if query_day(&tx, date)?.is_some_and(|d| d.finalized) {
                    return Ok(None);
                }

                let marked: HashSet<String> = {
                    let mut stmt = tx.prepare("SELECT student_id FROM attendance WHERE date = ?1")?;
                    let ids = stmt
                        .query_map([date.to_string()], |row| row.get::<_, String>(0))?
                        .collect::<Result<HashSet<_>, _>>()?;
                    ids
                };

                let registered = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {STUDENT_COLUMNS} FROM students WHERE face_registered = 1 ORDER BY rowid"
                    ))?;
                    let rows = stmt
                        .query_map([], student_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };

                let mut absent = Vec::new();
                for student in registered {
                    if marked.contains(&student.reg_no) || student.on_active_leave(now) {
                        continue;
                    }
                    let inserted = tx.execute(
                        "INSERT INTO attendance (student_id, date, status, time, marked_by)
                         VALUES (?1, ?2, 'Absent', NULL, ?3)
                         ON CONFLICT (student_id, date) DO NOTHING",
                        params![student.reg_no, date.to_string(), operator],
                    )?;
                    if inserted > 0 {
                        absent.push(student.reg_no);
                    }
                }

                tx.execute(
                    "INSERT INTO attendance_days (date, finalized, finalized_at, finalized_by)
                     VALUES (?1, 1, ?2, ?3)
                     ON CONFLICT (date) DO UPDATE SET
                        finalized = 1,
                        finalized_at = excluded.finalized_at,
                        finalized_by = excluded.finalized_by",
                    params![date.to_string(), now, operator],
                )?;
                tx.commit()?;
                Ok(Some(absent))
            })
            .await?;

        match absent {
            Some(absent) => Ok(FinalizeSummary {
                date,
                finalized_at: now,
                absent,
            }),
            None => Err(StoreError::AlreadyFinalized(date)),
        }
    }

    /// Records for one date, Present marks first in time order.
    pub async fn records_on(&self, date: Day) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM attendance WHERE date = ?1
                     ORDER BY time IS NULL, time, student_id"
                ))?;
                let rows = stmt
                    .query_map([date.to_string()], record_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?)
    }

    /// Records for every date in `month`, by date then time.
    pub async fn records_in_month(&self, month: Month) -> Result<Vec<AttendanceRecord>, StoreError> {
        let from = month.first_day().to_string();
        let to = month.last_day().to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM attendance WHERE date >= ?1 AND date <= ?2
                     ORDER BY date, time IS NULL, time, student_id"
                ))?;
                let rows = stmt
                    .query_map([from, to], record_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?)
    }

    /// One student's records, newest first, optionally limited to a month.
    pub async fn records_for_student(
        &self,
        reg_no: &str,
        month: Option<Month>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let key = reg_no.to_string();
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM attendance WHERE student_id = ?1 ORDER BY date DESC"
                ))?;
                let rows = stmt
                    .query_map([key], record_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(match month {
            Some(m) => records.into_iter().filter(|r| m.contains(r.date)).collect(),
            None => records,
        })
    }

    pub async fn present_count(&self, date: Day) -> Result<usize, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let n = conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE date = ?1 AND status = 'Present'",
                    [date.to_string()],
                    |row| row.get::<_, i64>(0),
                )?;
                Ok(n as usize)
            })
            .await?)
    }

    /// Registered students with no record of either status on `date` and
    /// not on active leave at `now`, sorted by room then name. Empty once the
    /// day is finalized.
    pub async fn pending(&self, date: Day, now: DateTime<Utc>) -> Result<Vec<Student>, StoreError> {
        let marked: HashSet<String> = self
            .records_on(date)
            .await?
            .into_iter()
            .map(|r| r.student_id)
            .collect();

        let filter = StudentFilter {
            face_registered: Some(true),
            ..Default::default()
        };
        let mut pending: Vec<Student> = self
            .list_students(&filter)
            .await?
            .into_iter()
            .filter(|s| !marked.contains(&s.reg_no) && !s.on_active_leave(now))
            .collect();
        pending.sort_by(|a, b| a.room_no.cmp(&b.room_no).then_with(|| a.name.cmp(&b.name)));
        Ok(pending)
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn conversion_error(idx: usize, err: RosterError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn query_student(conn: &rusqlite::Connection, reg_no: &str) -> rusqlite::Result<Option<Student>> {
    conn.query_row(
        &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE reg_no = ?1"),
        [reg_no],
        student_from_row,
    )
    .optional()
}

fn query_record(
    conn: &rusqlite::Connection,
    reg_no: &str,
    date: Day,
) -> rusqlite::Result<Option<AttendanceRecord>> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM attendance WHERE student_id = ?1 AND date = ?2"),
        params![reg_no, date.to_string()],
        record_from_row,
    )
    .optional()
}

fn query_day(conn: &rusqlite::Connection, date: Day) -> rusqlite::Result<Option<AttendanceDay>> {
    conn.query_row(
        "SELECT date, finalized, finalized_at, finalized_by FROM attendance_days WHERE date = ?1",
        [date.to_string()],
        |row| {
            Ok(AttendanceDay {
                date: parse_day(row, 0)?,
                finalized: row.get(1)?,
                finalized_at: row.get(2)?,
                finalized_by: row.get(3)?,
            })
        },
    )
    .optional()
}

fn parse_day(row: &Row<'_>, idx: usize) -> rusqlite::Result<Day> {
    row.get::<_, String>(idx)?
        .parse()
        .map_err(|e| conversion_error(idx, e))
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    let face_embedding = match row.get::<_, Option<String>>(8)? {
        Some(text) => {
            let values: Vec<f32> = serde_json::from_str(&text).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e))
            })?;
            (!values.is_empty()).then_some(Embedding { values })
        }
        None => None,
    };
    Ok(Student {
        id: row.get(0)?,
        reg_no: row.get(1)?,
        name: row.get(2)?,
        room_no: row.get(3)?,
        dept: row.get(4)?,
        category: row.get(5)?,
        college: row.get(6)?,
        face_registered: row.get(7)?,
        face_embedding,
        leave_status: row
            .get::<_, String>(9)?
            .parse()
            .map_err(|e| conversion_error(9, e))?,
        leave_until: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        student_id: row.get(0)?,
        date: parse_day(row, 1)?,
        status: row
            .get::<_, String>(2)?
            .parse()
            .map_err(|e| conversion_error(2, e))?,
        time: row.get(3)?,
        marked_by: row.get(4)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn new_student(reg_no: &str, name: &str, room: &str) -> NewStudent {
        NewStudent {
            reg_no: reg_no.into(),
            name: name.into(),
            room_no: room.into(),
            dept: "CSE".into(),
            category: "Counselling".into(),
            college: "HIT".into(),
        }
    }

    pub(crate) fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 10, 12, 0, 0).unwrap()
    }

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec() }
    }

    #[tokio::test]
    async fn test_insert_and_get_student() {
        let store = Store::open_in_memory().await.unwrap();
        let created = store.insert_student(new_student("21CS001", "Asha", "101"), noon()).await.unwrap();
        let fetched = store.get_student("21CS001").await.unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.created_at, noon());
        assert!(!fetched.face_registered);
        assert!(fetched.face_embedding.is_none());
        assert_eq!(fetched.leave_status, LeaveStatus::None);
    }

    #[tokio::test]
    async fn test_duplicate_reg_no_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_student(new_student("21CS001", "Asha", "101"), noon()).await.unwrap();
        let err = store
            .insert_student(new_student("21CS001", "Other", "102"), noon())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateStudent(r) if r == "21CS001"));
    }

    #[tokio::test]
    async fn test_register_embedding_is_write_once() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_student(new_student("21CS001", "Asha", "101"), noon()).await.unwrap();

        let student = store.register_embedding("21CS001", &emb(&[1.0, 0.0])).await.unwrap();
        assert!(student.face_registered);

        let err = store.register_embedding("21CS001", &emb(&[0.0, 1.0])).await.unwrap_err();
        assert!(matches!(err, StoreError::FaceAlreadyRegistered(_)));

        let stored = store.get_student("21CS001").await.unwrap().unwrap();
        assert_eq!(stored.face_embedding, Some(emb(&[1.0, 0.0])));

        let err = store.register_embedding("NOPE", &emb(&[1.0])).await.unwrap_err();
        assert!(matches!(err, StoreError::StudentNotFound(_)));
    }

    #[tokio::test]
    async fn test_candidates_in_enrollment_order() {
        let store = Store::open_in_memory().await.unwrap();
        for (reg, name) in [("B2", "Zed"), ("A1", "Amy"), ("C3", "Cal")] {
            store.insert_student(new_student(reg, name, "1"), noon()).await.unwrap();
        }
        store.register_embedding("C3", &emb(&[0.0, 1.0])).await.unwrap();
        store.register_embedding("B2", &emb(&[1.0, 0.0])).await.unwrap();

        let ids: Vec<String> = store.candidates().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["B2", "C3"]);
    }

    #[tokio::test]
    async fn test_mark_present_unique_per_day() {
        let store = Store::open_in_memory().await.unwrap();
        let day = Day::of(noon());
        store.mark_present("21CS001", day, noon(), "warden-1").await.unwrap();

        let err = store
            .mark_present("21CS001", day, noon() + chrono::Duration::minutes(5), "warden-2")
            .await
            .unwrap_err();
        match err {
            StoreError::AlreadyMarked { marked_at, .. } => assert_eq!(marked_at, Some(noon())),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.records_on(day).await.unwrap().len(), 1);

        // A different date is a separate record.
        let next = Day::of(noon() + chrono::Duration::days(1));
        store.mark_present("21CS001", next, noon(), "warden-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_marks_produce_one_record() {
        let store = Store::open_in_memory().await.unwrap();
        let day = Day::of(noon());
        let (a, b) = tokio::join!(
            store.mark_present("21CS001", day, noon(), "w1"),
            store.mark_present("21CS001", day, noon(), "w2"),
        );
        assert!(a.is_ok() ^ b.is_ok());
        assert_eq!(store.records_on(day).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_present_after_finalize_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let day = Day::of(noon());
        store.finalize_day(day, noon(), "warden").await.unwrap();
        let err = store.mark_present("21CS001", day, noon(), "warden").await.unwrap_err();
        assert!(matches!(err, StoreError::DayFinalized(d) if d == day));
        assert!(store.records_on(day).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_twice_fails() {
        let store = Store::open_in_memory().await.unwrap();
        let day = Day::of(noon());
        store.finalize_day(day, noon(), "warden").await.unwrap();
        let err = store.finalize_day(day, noon(), "warden").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyFinalized(_)));

        let row = store.day(day).await.unwrap().unwrap();
        assert!(row.finalized);
        assert_eq!(row.finalized_by.as_deref(), Some("warden"));
        assert_eq!(row.finalized_at, Some(noon()));
    }

    #[tokio::test]
    async fn test_update_student_keeps_face_and_leave() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_student(new_student("21CS001", "Asha", "101"), noon()).await.unwrap();
        store.register_embedding("21CS001", &emb(&[1.0, 0.0])).await.unwrap();
        store.set_leave("21CS001", LeaveStatus::Medical, None).await.unwrap();

        let update = StudentUpdate {
            room_no: Some("204".into()),
            category: Some("Management".into()),
            ..Default::default()
        };
        let s = store.update_student("21CS001", update).await.unwrap();
        assert_eq!(s.room_no, "204");
        assert_eq!(s.category, "Management");

        let stored = store.get_student("21CS001").await.unwrap().unwrap();
        assert_eq!(stored.room_no, "204");
        assert_eq!(stored.name, "Asha");
        assert!(stored.face_registered);
        assert_eq!(stored.face_embedding, Some(emb(&[1.0, 0.0])));
        assert_eq!(stored.leave_status, LeaveStatus::Medical);

        let err = store
            .update_student("NOPE", StudentUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StudentNotFound(_)));
    }

    #[tokio::test]
    async fn test_set_leave_clears_until_for_none() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_student(new_student("21CS001", "Asha", "101"), noon()).await.unwrap();

        let until = noon() + chrono::Duration::days(3);
        let s = store.set_leave("21CS001", LeaveStatus::Medical, Some(until)).await.unwrap();
        assert_eq!(s.leave_status, LeaveStatus::Medical);
        assert_eq!(s.leave_until, Some(until));

        let s = store.set_leave("21CS001", LeaveStatus::None, Some(until)).await.unwrap();
        assert_eq!(s.leave_status, LeaveStatus::None);
        assert_eq!(s.leave_until, None);

        let err = store.set_leave("NOPE", LeaveStatus::OnLeave, None).await.unwrap_err();
        assert!(matches!(err, StoreError::StudentNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_filter_and_count() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_student(new_student("21CS001", "Zara", "101"), noon()).await.unwrap();
        store.insert_student(new_student("21ME002", "Arun", "102"), noon()).await.unwrap();
        store.register_embedding("21ME002", &emb(&[1.0])).await.unwrap();

        let all = store.list_students(&StudentFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["Arun", "Zara"]);

        let search = StudentFilter { search: Some("cs0".into()), ..Default::default() };
        assert_eq!(store.list_students(&search).await.unwrap().len(), 1);

        let registered = StudentFilter { face_registered: Some(true), ..Default::default() };
        let found = store.list_students(&registered).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].reg_no, "21ME002");

        assert_eq!(store.count_students().await.unwrap(), (2, 1));
        assert!(store.delete_student("21CS001").await.unwrap());
        assert!(!store.delete_student("21CS001").await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_excludes_marked_and_leave() {
        let store = Store::open_in_memory().await.unwrap();
        for (reg, name, room) in [("A1", "Zed", "102"), ("B2", "Amy", "102"), ("C3", "Cal", "101"), ("D4", "Dev", "101")] {
            store.insert_student(new_student(reg, name, room), noon()).await.unwrap();
            store.register_embedding(reg, &emb(&[1.0])).await.unwrap();
        }
        let day = Day::of(noon());
        store.mark_present("A1", day, noon(), "w").await.unwrap();
        store.set_leave("D4", LeaveStatus::OnLeave, None).await.unwrap();

        let pending = store.pending(day, noon()).await.unwrap();
        let regs: Vec<&str> = pending.iter().map(|s| s.reg_no.as_str()).collect();
        assert_eq!(regs, vec!["C3", "B2"]);

        // Absent marks from finalization close out the rest.
        store.finalize_day(day, noon(), "w").await.unwrap();
        assert!(store.pending(day, noon()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_month_and_history_queries() {
        let store = Store::open_in_memory().await.unwrap();
        let feb10: Day = "2025-02-10".parse().unwrap();
        let feb28: Day = "2025-02-28".parse().unwrap();
        let mar01: Day = "2025-03-01".parse().unwrap();
        for day in [feb10, feb28, mar01] {
            store.mark_present("21CS001", day, noon(), "w").await.unwrap();
        }

        let feb: Month = "2025-02".parse().unwrap();
        let in_feb = store.records_in_month(feb).await.unwrap();
        assert_eq!(in_feb.iter().map(|r| r.date).collect::<Vec<_>>(), vec![feb10, feb28]);

        let history = store.records_for_student("21CS001", None).await.unwrap();
        assert_eq!(history.first().map(|r| r.date), Some(mar01));
        let feb_history = store.records_for_student("21CS001", Some(feb)).await.unwrap();
        assert_eq!(feb_history.len(), 2);
    }
}
