use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::AggregateError;
use crate::models::{
    ActivityCounts, AssignmentEvent, ManagedStudent, MonthlySnapshot, ReportLevel, SnapshotTotals,
    StaffDashboard, StaffRef,
};
use crate::month::MonthKey;
use crate::payload::StaffPayload;

/// Builds one snapshot per calendar month from the first assignment through `now`.
///
/// Months are bucketed in `tz`. A first assignment dated after `now` still yields
/// its own month, and nothing past it.
pub fn aggregate(events: &[AssignmentEvent], now: DateTime<Utc>, tz: Tz) -> Vec<MonthlySnapshot> {
    let mut ordered: Vec<&AssignmentEvent> = events.iter().collect();
    // Ties on the timestamp fall back to student id so input order never leaks through.
    ordered.sort_by(|a, b| {
        a.assigned_at
            .cmp(&b.assigned_at)
            .then_with(|| a.student.id.cmp(&b.student.id))
    });

    let Some(first) = ordered.first() else {
        return Vec::new();
    };

    let mut cohorts: BTreeMap<MonthKey, Vec<&AssignmentEvent>> = BTreeMap::new();
    for event in ordered.iter() {
        cohorts
            .entry(MonthKey::of(event.assigned_at, tz))
            .or_default()
            .push(*event);
    }

    let start = MonthKey::of(first.assigned_at, tz);
    let span = (start.months_until(MonthKey::of(now, tz)) + 1).max(1);
    tracing::debug!(start = %start, span, events = events.len(), "aggregating cohort months");

    let mut roster: Vec<&AssignmentEvent> = Vec::new();
    let mut snapshots = Vec::with_capacity(span as usize);
    let mut month = start;
    let mut carried_over = 0;

    for _ in 0..span {
        let joined = cohorts.get(&month).map(Vec::as_slice).unwrap_or(&[]);
        roster.extend_from_slice(joined);

        let managed_students: Vec<ManagedStudent> = roster
            .iter()
            .map(|event| managed_for_month(event, month, tz))
            .collect();
        let activity = count_activity(&managed_students);
        let total_managed = carried_over + joined.len();

        snapshots.push(MonthlySnapshot {
            month,
            newly_assigned: joined.len(),
            carried_over,
            total_managed,
            managed_students,
            activity,
        });

        carried_over = total_managed;
        month = month.succ();
    }

    snapshots
}

/// Converts a raw export and aggregates it; any bad timestamp fails the whole staff member.
pub fn aggregate_payload(
    payload: &StaffPayload,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Vec<MonthlySnapshot>, AggregateError> {
    let events = payload.to_events(tz)?;
    Ok(aggregate(&events, now, tz))
}

/// Aggregates each staff member on their own so one bad export cannot sink the rest.
pub fn build_dashboard(
    payloads: &[StaffPayload],
    now: DateTime<Utc>,
    tz: Tz,
) -> Vec<(StaffRef, Result<StaffDashboard, AggregateError>)> {
    payloads
        .iter()
        .map(|payload| {
            let staff = payload.staff();
            let result = aggregate_payload(payload, now, tz).map(|snapshots| StaffDashboard {
                staff: staff.clone(),
                snapshots,
            });
            (staff, result)
        })
        .collect()
}

pub fn totals(snapshots: &[MonthlySnapshot]) -> SnapshotTotals {
    let mut summary = SnapshotTotals {
        months: snapshots.len(),
        total_managed: snapshots.last().map(|s| s.total_managed).unwrap_or(0),
        ..SnapshotTotals::default()
    };

    for snapshot in snapshots {
        summary.newly_assigned += snapshot.newly_assigned;
        summary.activity.absorb(&snapshot.activity);
    }

    summary
}

fn managed_for_month(event: &AssignmentEvent, month: MonthKey, tz: Tz) -> ManagedStudent {
    let student = &event.student;
    ManagedStudent {
        student_id: student.id,
        name: student.name.clone(),
        assigned_at: event.assigned_at,
        care_interactions: student
            .care_interactions
            .iter()
            .filter(|care| month.contains(care.occurred_at, tz))
            .cloned()
            .collect(),
        course_memos: student
            .course_memos
            .iter()
            .filter(|memo| month.contains(memo.created_at, tz))
            .cloned()
            .collect(),
        escalation_reports: student
            .escalation_reports
            .iter()
            .filter(|report| month.contains(report.created_at, tz))
            .cloned()
            .collect(),
    }
}

fn count_activity(students: &[ManagedStudent]) -> ActivityCounts {
    let mut counts = ActivityCounts::default();

    for student in students {
        for care in &student.care_interactions {
            if care.is_done() {
                counts.care_done += 1;
            }
            if care.watched_video {
                counts.video_watched += 1;
            }
            counts.customer_types.record(care.customer_type);
        }

        for memo in &student.course_memos {
            if memo.is_done() {
                counts.memo_done += 1;
            } else {
                counts.memo_not_done += 1;
            }
        }

        for report in &student.escalation_reports {
            match report.level {
                ReportLevel::Hot => counts.hot_reports += 1,
                ReportLevel::Normal => counts.normal_reports += 1,
            }
        }
    }

    counts
}
