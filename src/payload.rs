//! Shape of the reporting API's per-staff export and its conversion into
//! typed domain records.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AggregateError;
use crate::models::{
    AssignmentEvent, CareInteraction, CourseMemo, CustomerType, EscalationReport, ReportLevel,
    StaffRef, StudentRecord,
};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

// Skipped local time never exceeds a day (Samoa, 2011-12-30).
const GAP_STEP_MINUTES: i64 = 15;
const GAP_SEARCH_STEPS: i64 = 24 * 60 / GAP_STEP_MINUTES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaffPayload {
    pub staff_id: Uuid,
    pub staff_name: String,
    pub staff_email: String,
    #[serde(default)]
    pub assignments: Vec<AssignmentPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentPayload {
    pub created_time: String,
    pub student: StudentPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentPayload {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub customer_care: Vec<CarePayload>,
    #[serde(default)]
    pub scheduled_memos: Vec<MemoPayload>,
    #[serde(default)]
    pub reports: Vec<ReportPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarePayload {
    pub created_time: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub watched_video: bool,
    #[serde(default)]
    pub customer_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoPayload {
    pub created_time: String,
    #[serde(default)]
    pub teacher_note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPayload {
    pub created_time: String,
    #[serde(default)]
    pub level: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PayloadFile {
    Many(Vec<StaffPayload>),
    One(StaffPayload),
}

/// Reads either a single staff object or an array of them.
pub fn read_payloads(path: &Path) -> anyhow::Result<Vec<StaffPayload>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: PayloadFile = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a staff payload export", path.display()))?;

    Ok(match parsed {
        PayloadFile::Many(payloads) => payloads,
        PayloadFile::One(payload) => vec![payload],
    })
}

/// Accepts RFC 3339, naive date-times read as local time in `tz`, or a bare date at local midnight.
pub fn parse_timestamp(
    value: &str,
    tz: Tz,
    field: &'static str,
) -> Result<DateTime<Utc>, AggregateError> {
    let trimmed = value.trim();
    let invalid = || AggregateError::InvalidTimestamp {
        field,
        value: value.to_string(),
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(invalid)?;

    resolve_local(naive, tz)
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(invalid)
}

/// Resolves a wall-clock time in `tz`; a time inside a DST gap moves to the first instant after it.
fn resolve_local(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Tz>> {
    (0..=GAP_SEARCH_STEPS).find_map(|step| {
        tz.from_local_datetime(&(naive + Duration::minutes(GAP_STEP_MINUTES * step)))
            .earliest()
    })
}

impl StaffPayload {
    pub fn staff(&self) -> StaffRef {
        StaffRef {
            id: self.staff_id,
            name: self.staff_name.clone(),
            email: self.staff_email.clone(),
        }
    }

    /// Converts every assignment, failing on the first unreadable timestamp.
    pub fn to_events(&self, tz: Tz) -> Result<Vec<AssignmentEvent>, AggregateError> {
        self.assignments
            .iter()
            .map(|assignment| assignment.to_event(tz))
            .collect()
    }
}

impl AssignmentPayload {
    pub fn to_event(&self, tz: Tz) -> Result<AssignmentEvent, AggregateError> {
        Ok(AssignmentEvent {
            assigned_at: parse_timestamp(&self.created_time, tz, "created_time")?,
            student: self.student.to_record(tz)?,
        })
    }
}

impl StudentPayload {
    pub fn to_record(&self, tz: Tz) -> Result<StudentRecord, AggregateError> {
        let care_interactions = self
            .customer_care
            .iter()
            .map(|care| {
                Ok(CareInteraction {
                    occurred_at: parse_timestamp(&care.created_time, tz, "customer_care.created_time")?,
                    kind: care.kind.clone(),
                    watched_video: care.watched_video,
                    customer_type: CustomerType::from_label(care.customer_type.as_deref()),
                })
            })
            .collect::<Result<Vec<_>, AggregateError>>()?;

        let course_memos = self
            .scheduled_memos
            .iter()
            .map(|memo| {
                Ok(CourseMemo {
                    created_at: parse_timestamp(&memo.created_time, tz, "scheduled_memos.created_time")?,
                    teacher_note: memo.teacher_note.clone(),
                })
            })
            .collect::<Result<Vec<_>, AggregateError>>()?;

        let escalation_reports = self
            .reports
            .iter()
            .map(|report| {
                Ok(EscalationReport {
                    created_at: parse_timestamp(&report.created_time, tz, "reports.created_time")?,
                    level: ReportLevel::from_label(&report.level),
                })
            })
            .collect::<Result<Vec<_>, AggregateError>>()?;

        Ok(StudentRecord {
            id: self.id,
            name: self.name.clone(),
            care_interactions,
            course_memos,
            escalation_reports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_rfc3339_with_offset() {
        let parsed = parse_timestamp("2024-01-10T09:30:00+09:00", chrono_tz::UTC, "t").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 10, 0, 30, 0).unwrap());
    }

    #[test]
    fn naive_values_are_local_to_zone() {
        let tz = chrono_tz::Asia::Seoul;
        let spaced = parse_timestamp("2024-03-01 08:00:00", tz, "t").unwrap();
        let tee = parse_timestamp("2024-03-01T08:00:00.250", tz, "t").unwrap();
        assert_eq!(spaced, Utc.with_ymd_and_hms(2024, 2, 29, 23, 0, 0).unwrap());
        assert_eq!(tee.timestamp(), spaced.timestamp());

        let date_only = parse_timestamp("2024-03-01", chrono_tz::UTC, "t").unwrap();
        assert_eq!(date_only, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn dates_in_dst_gap_resolve_to_first_valid_instant() {
        let santiago = chrono_tz::America::Santiago;
        let midnight = parse_timestamp("2024-09-08", santiago, "reports.created_time").unwrap();
        let local = midnight.with_timezone(&santiago);
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2024, 9, 8).unwrap());
        assert_eq!(midnight, Utc.with_ymd_and_hms(2024, 9, 8, 4, 0, 0).unwrap());

        let skipped = parse_timestamp("2024-03-10 02:30:00", chrono_tz::America::New_York, "t").unwrap();
        assert_eq!(skipped, Utc.with_ymd_and_hms(2024, 3, 10, 7, 0, 0).unwrap());
    }

    #[test]
    fn ambiguous_local_time_takes_earlier_offset() {
        let repeated = parse_timestamp("2024-11-03 01:30:00", chrono_tz::America::New_York, "t").unwrap();
        assert_eq!(repeated, Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap());
    }

    #[test]
    fn rejects_garbage_and_empty() {
        for value in ["", "yesterday", "2024-13-01", "10/01/2024"] {
            let err = parse_timestamp(value, chrono_tz::UTC, "created_time").unwrap_err();
            assert_eq!(
                err,
                AggregateError::InvalidTimestamp {
                    field: "created_time",
                    value: value.to_string(),
                }
            );
        }
    }

    fn sample_payload(report_time: &str) -> StaffPayload {
        serde_json::from_value(json!({
            "staff_id": "3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2",
            "staff_name": "Mina Cho",
            "staff_email": "mina.cho@example.com",
            "assignments": [{
                "created_time": "2024-01-10T09:00:00Z",
                "student": {
                    "id": "0c22f1f1-9184-4fd4-9b21-28c68a6a89dc",
                    "name": "Avery Lee",
                    "customer_care": [
                        {"created_time": "2024-02-15 10:00:00", "type": "call",
                         "watched_video": true, "customer_type": "vip"},
                        {"created_time": "2024-02-16 10:00:00", "type": null}
                    ],
                    "scheduled_memos": [{"created_time": "2024-02-20", "teacher_note": null}],
                    "reports": [{"created_time": report_time, "level": "hot"}]
                }
            }]
        }))
        .unwrap()
    }

    #[test]
    fn converts_nested_student_activity() {
        let events = sample_payload("2024-02-21T00:00:00Z")
            .to_events(chrono_tz::UTC)
            .unwrap();
        assert_eq!(events.len(), 1);

        let student = &events[0].student;
        assert_eq!(student.name, "Avery Lee");
        assert_eq!(student.care_interactions.len(), 2);
        assert_eq!(student.care_interactions[0].customer_type, CustomerType::Vip);
        assert!(student.care_interactions[0].watched_video);
        assert!(!student.care_interactions[1].is_done());
        assert!(!student.care_interactions[1].watched_video);
        assert!(!student.course_memos[0].is_done());
        assert_eq!(student.escalation_reports[0].level, ReportLevel::Hot);
    }

    #[test]
    fn nested_bad_timestamp_fails_whole_conversion() {
        let err = sample_payload("not a date")
            .to_events(chrono_tz::UTC)
            .unwrap_err();
        assert!(matches!(
            err,
            AggregateError::InvalidTimestamp { field: "reports.created_time", .. }
        ));
    }

    #[test]
    fn missing_collections_default_to_empty() {
        let payload: StaffPayload = serde_json::from_value(json!({
            "staff_id": "3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2",
            "staff_name": "Mina Cho",
            "staff_email": "mina.cho@example.com",
            "assignments": [{
                "created_time": "2024-01-10",
                "student": {"id": "0c22f1f1-9184-4fd4-9b21-28c68a6a89dc", "name": "Avery Lee"}
            }]
        }))
        .unwrap();

        let events = payload.to_events(chrono_tz::UTC).unwrap();
        assert!(events[0].student.care_interactions.is_empty());
        assert!(events[0].student.course_memos.is_empty());
        assert!(events[0].student.escalation_reports.is_empty());
    }
}
