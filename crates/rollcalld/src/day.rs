//! Per-date attendance state: `Open` until finalized, then `Finalized` for good.

use chrono::{DateTime, Utc};
use rollcall_core::Day;
use serde::Serialize;

use crate::error::AttendanceError;
use crate::store::{FinalizeSummary, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DayState {
    Open,
    Finalized,
}

/// Read-only view of one date.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayStatus {
    pub date: Day,
    pub status: DayState,
    pub finalized: bool,
    pub finalized_at: Option<DateTime<Utc>>,
    pub finalized_by: Option<String>,
    pub present_count: usize,
    pub total_students: usize,
}

#[derive(Clone)]
pub struct DayLedger {
    store: Store,
}

impl DayLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn is_finalized(&self, date: Day) -> Result<bool, AttendanceError> {
        Ok(self.store.day(date).await?.is_some_and(|d| d.finalized))
    }

    pub async fn status(&self, date: Day) -> Result<DayStatus, AttendanceError> {
        let day = self.store.day(date).await?;
        let present_count = self.store.present_count(date).await?;
        let (_, registered) = self.store.count_students().await?;

        let finalized = day.as_ref().is_some_and(|d| d.finalized);
        Ok(DayStatus {
            date,
            status: if finalized { DayState::Finalized } else { DayState::Open },
            finalized,
            finalized_at: day.as_ref().and_then(|d| d.finalized_at),
            finalized_by: day.and_then(|d| d.finalized_by),
            present_count,
            total_students: registered,
        })
    }

    /// Close `date`, back-filling Absent marks. Irreversible.
    pub async fn finalize(
        &self,
        date: Day,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<FinalizeSummary, AttendanceError> {
        let summary = self.store.finalize_day(date, now, operator).await?;
        tracing::info!(
            date = %date,
            operator,
            absent = summary.absent.len(),
            "attendance finalized"
        );
        Ok(summary)
    }
}
