//! rollcall-core — Face-match and attendance primitives.
//!
//! Embedding normalization and cosine matching, the local image quality
//! gate, and the roster/attendance record types shared by the daemon and
//! the embedding client.

pub mod quality;
pub mod roster;
pub mod types;

pub use roster::{
    AttendanceDay, AttendanceRecord, AttendanceStatus, Day, LeaveStatus, Month, NewStudent,
    Student, StudentUpdate,
};
pub use types::{BestMatch, Candidate, CosineMatcher, Embedding, MatchResult, Matcher};

/// Default cosine similarity required to accept a match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.55;
