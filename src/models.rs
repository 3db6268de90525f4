use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::month::MonthKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerType {
    Normal,
    New,
    Warning,
    Dear,
    Vip,
    Business,
}

impl CustomerType {
    /// Null and unrecognised labels both classify as `Normal`.
    pub fn from_label(label: Option<&str>) -> Self {
        match label.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("new") => CustomerType::New,
            Some("warning") => CustomerType::Warning,
            Some("dear") => CustomerType::Dear,
            Some("vip") => CustomerType::Vip,
            Some("business") => CustomerType::Business,
            _ => CustomerType::Normal,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CustomerType::Normal => "normal",
            CustomerType::New => "new",
            CustomerType::Warning => "warning",
            CustomerType::Dear => "dear",
            CustomerType::Vip => "vip",
            CustomerType::Business => "business",
        }
    }

    /// `None` for `Normal`, which is stored as null.
    pub fn stored_label(&self) -> Option<&'static str> {
        match self {
            CustomerType::Normal => None,
            other => Some(other.label()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLevel {
    Hot,
    Normal,
}

impl ReportLevel {
    pub fn from_label(label: &str) -> Self {
        if label.trim().eq_ignore_ascii_case("hot") {
            ReportLevel::Hot
        } else {
            ReportLevel::Normal
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReportLevel::Hot => "hot",
            ReportLevel::Normal => "normal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CareInteraction {
    pub occurred_at: DateTime<Utc>,
    pub kind: Option<String>,
    pub watched_video: bool,
    pub customer_type: CustomerType,
}

impl CareInteraction {
    /// A blank or missing kind means the interaction has not happened yet.
    pub fn is_done(&self) -> bool {
        self.kind
            .as_deref()
            .map(|kind| !kind.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseMemo {
    pub created_at: DateTime<Utc>,
    pub teacher_note: Option<String>,
}

impl CourseMemo {
    pub fn is_done(&self) -> bool {
        self.teacher_note.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationReport {
    pub created_at: DateTime<Utc>,
    pub level: ReportLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentRecord {
    pub id: Uuid,
    pub name: String,
    pub care_interactions: Vec<CareInteraction>,
    pub course_memos: Vec<CourseMemo>,
    pub escalation_reports: Vec<EscalationReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentEvent {
    pub assigned_at: DateTime<Utc>,
    pub student: StudentRecord,
}

#[derive(Debug, Clone)]
pub struct StaffRef {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

/// A roster entry as seen from one month: activity outside that month is dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedStudent {
    pub student_id: Uuid,
    pub name: String,
    pub assigned_at: DateTime<Utc>,
    pub care_interactions: Vec<CareInteraction>,
    pub course_memos: Vec<CourseMemo>,
    pub escalation_reports: Vec<EscalationReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CustomerTypeCounts {
    pub normal: usize,
    pub new: usize,
    pub warning: usize,
    pub dear: usize,
    pub vip: usize,
    pub business: usize,
}

impl CustomerTypeCounts {
    pub fn record(&mut self, customer_type: CustomerType) {
        let slot = match customer_type {
            CustomerType::Normal => &mut self.normal,
            CustomerType::New => &mut self.new,
            CustomerType::Warning => &mut self.warning,
            CustomerType::Dear => &mut self.dear,
            CustomerType::Vip => &mut self.vip,
            CustomerType::Business => &mut self.business,
        };
        *slot += 1;
    }

    pub fn get(&self, customer_type: CustomerType) -> usize {
        match customer_type {
            CustomerType::Normal => self.normal,
            CustomerType::New => self.new,
            CustomerType::Warning => self.warning,
            CustomerType::Dear => self.dear,
            CustomerType::Vip => self.vip,
            CustomerType::Business => self.business,
        }
    }

    pub fn absorb(&mut self, other: &CustomerTypeCounts) {
        self.normal += other.normal;
        self.new += other.new;
        self.warning += other.warning;
        self.dear += other.dear;
        self.vip += other.vip;
        self.business += other.business;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivityCounts {
    pub care_done: usize,
    pub video_watched: usize,
    pub memo_done: usize,
    pub memo_not_done: usize,
    pub hot_reports: usize,
    pub normal_reports: usize,
    pub customer_types: CustomerTypeCounts,
}

impl ActivityCounts {
    pub fn absorb(&mut self, other: &ActivityCounts) {
        self.care_done += other.care_done;
        self.video_watched += other.video_watched;
        self.memo_done += other.memo_done;
        self.memo_not_done += other.memo_not_done;
        self.hot_reports += other.hot_reports;
        self.normal_reports += other.normal_reports;
        self.customer_types.absorb(&other.customer_types);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlySnapshot {
    pub month: MonthKey,
    pub newly_assigned: usize,
    pub carried_over: usize,
    pub total_managed: usize,
    pub managed_students: Vec<ManagedStudent>,
    pub activity: ActivityCounts,
}

impl MonthlySnapshot {
    /// Completed care interactions as a percentage of the managed roster.
    pub fn care_rate(&self) -> f64 {
        if self.total_managed == 0 {
            0.0
        } else {
            self.activity.care_done as f64 / self.total_managed as f64 * 100.0
        }
    }
}

/// The summary row under a staff member's monthly table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotTotals {
    pub months: usize,
    pub newly_assigned: usize,
    pub total_managed: usize,
    pub activity: ActivityCounts,
}

#[derive(Debug, Clone)]
pub struct StaffDashboard {
    pub staff: StaffRef,
    pub snapshots: Vec<MonthlySnapshot>,
}
