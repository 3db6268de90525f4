use std::fmt::Write;
use std::io;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::cohort;
use crate::error::AggregateError;
use crate::models::{CustomerType, MonthlySnapshot, StaffDashboard, StaffRef};

const CUSTOMER_TYPES: [CustomerType; 6] = [
    CustomerType::Normal,
    CustomerType::New,
    CustomerType::Warning,
    CustomerType::Dear,
    CustomerType::Vip,
    CustomerType::Business,
];

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    staff: &'a str,
    month: String,
    new: usize,
    old: usize,
    total: usize,
    care_done: usize,
    care_rate: String,
    video_watched: usize,
    memo_done: usize,
    memo_not_done: usize,
    hot_reports: usize,
    normal_reports: usize,
    normal: usize,
    new_customer: usize,
    warning: usize,
    dear: usize,
    vip: usize,
    business: usize,
}

/// One spreadsheet row per staff member and month, under a single header.
pub fn write_csv<W: io::Write>(
    writer: W,
    dashboards: &[(String, Vec<MonthlySnapshot>)],
) -> anyhow::Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);

    for (staff_name, snapshot) in dashboards
        .iter()
        .flat_map(|(name, snapshots)| snapshots.iter().map(move |s| (name, s)))
    {
        let types = &snapshot.activity.customer_types;
        csv_writer.serialize(CsvRow {
            staff: staff_name,
            month: snapshot.month.to_string(),
            new: snapshot.newly_assigned,
            old: snapshot.carried_over,
            total: snapshot.total_managed,
            care_done: snapshot.activity.care_done,
            care_rate: format!("{:.1}", snapshot.care_rate()),
            video_watched: snapshot.activity.video_watched,
            memo_done: snapshot.activity.memo_done,
            memo_not_done: snapshot.activity.memo_not_done,
            hot_reports: snapshot.activity.hot_reports,
            normal_reports: snapshot.activity.normal_reports,
            normal: types.normal,
            new_customer: types.new,
            warning: types.warning,
            dear: types.dear,
            vip: types.vip,
            business: types.business,
        })?;
    }

    csv_writer.flush()?;
    Ok(())
}

/// Plain-text table for terminal output.
pub fn render_table(staff_name: &str, snapshots: &[MonthlySnapshot]) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "{staff_name}");

    if snapshots.is_empty() {
        let _ = writeln!(output, "  No assignments recorded.");
        return output;
    }

    let _ = writeln!(
        output,
        "  {:<8} {:>4} {:>4} {:>6} {:>5} {:>7} {:>6} {:>5} {:>5} {:>4} {:>6}",
        "month", "new", "old", "total", "care", "rate", "video", "memo", "open", "hot", "normal"
    );
    for snapshot in snapshots {
        let activity = &snapshot.activity;
        let _ = writeln!(
            output,
            "  {:<8} {:>4} {:>4} {:>6} {:>5} {:>6.1}% {:>6} {:>5} {:>5} {:>4} {:>6}",
            snapshot.month,
            snapshot.newly_assigned,
            snapshot.carried_over,
            snapshot.total_managed,
            activity.care_done,
            snapshot.care_rate(),
            activity.video_watched,
            activity.memo_done,
            activity.memo_not_done,
            activity.hot_reports,
            activity.normal_reports
        );
    }

    output
}

pub fn build_report(
    now: DateTime<Utc>,
    tz: Tz,
    results: &[(StaffRef, Result<StaffDashboard, AggregateError>)],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Customer Care Dashboard");
    let _ = writeln!(
        output,
        "Generated as of {} ({})",
        now.with_timezone(&tz).format("%Y-%m-%d %H:%M"),
        tz.name()
    );

    if results.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "No staff members found.");
        return output;
    }

    let mut failures = Vec::new();
    for (staff, result) in results {
        match result {
            Ok(dashboard) => write_staff_section(&mut output, dashboard, tz),
            Err(err) => failures.push((staff, err)),
        }
    }

    if !failures.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Skipped Staff");
        for (staff, err) in failures {
            let _ = writeln!(output, "- {} ({}): {}", staff.name, staff.email, err);
        }
    }

    output
}

fn write_staff_section(output: &mut String, dashboard: &StaffDashboard, tz: Tz) {
    let staff = &dashboard.staff;
    let snapshots = &dashboard.snapshots;

    let _ = writeln!(output);
    let _ = writeln!(output, "## {} ({})", staff.name, staff.email);

    if snapshots.is_empty() {
        let _ = writeln!(output, "No students assigned yet.");
        return;
    }

    let _ = writeln!(
        output,
        "| Month | New | Old | Total | Care done | Care rate | Videos | Memo done | Memo open | Hot | Normal |"
    );
    let _ = writeln!(output, "|---|---|---|---|---|---|---|---|---|---|---|");
    for snapshot in snapshots {
        let activity = &snapshot.activity;
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} | {:.1}% | {} | {} | {} | {} | {} |",
            snapshot.month,
            snapshot.newly_assigned,
            snapshot.carried_over,
            snapshot.total_managed,
            activity.care_done,
            snapshot.care_rate(),
            activity.video_watched,
            activity.memo_done,
            activity.memo_not_done,
            activity.hot_reports,
            activity.normal_reports
        );
    }

    let summary = cohort::totals(snapshots);
    let _ = writeln!(
        output,
        "| **Total ({} months)** | {} | | {} | {} | | {} | {} | {} | {} | {} |",
        summary.months,
        summary.newly_assigned,
        summary.total_managed,
        summary.activity.care_done,
        summary.activity.video_watched,
        summary.activity.memo_done,
        summary.activity.memo_not_done,
        summary.activity.hot_reports,
        summary.activity.normal_reports
    );

    let Some(latest) = snapshots.last() else {
        return;
    };

    let _ = writeln!(output);
    let _ = writeln!(output, "### Customer Types in {}", latest.month);
    for customer_type in CUSTOMER_TYPES {
        let _ = writeln!(
            output,
            "- {}: {}",
            customer_type.label(),
            latest.activity.customer_types.get(customer_type)
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "<details><summary>Roster for {}</summary>", latest.month);
    let _ = writeln!(output);
    for student in &latest.managed_students {
        let _ = writeln!(
            output,
            "- {} (assigned {}): {} care, {} memos, {} reports this month",
            student.name,
            student.assigned_at.with_timezone(&tz).format("%Y-%m-%d"),
            student.care_interactions.len(),
            student.course_memos.len(),
            student.escalation_reports.len()
        );
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "</details>");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivityCounts, ManagedStudent};
    use crate::month::MonthKey;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn staff(name: &str) -> StaffRef {
        StaffRef {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
        }
    }

    fn snapshot(month: u32, new: usize, old: usize, care_done: usize) -> MonthlySnapshot {
        let roster = (0..new + old)
            .map(|idx| ManagedStudent {
                student_id: Uuid::new_v4(),
                name: format!("Student {idx}"),
                assigned_at: Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap(),
                care_interactions: Vec::new(),
                course_memos: Vec::new(),
                escalation_reports: Vec::new(),
            })
            .collect();
        MonthlySnapshot {
            month: MonthKey::new(2024, month).unwrap(),
            newly_assigned: new,
            carried_over: old,
            total_managed: new + old,
            managed_students: roster,
            activity: ActivityCounts {
                care_done,
                ..ActivityCounts::default()
            },
        }
    }

    #[test]
    fn report_lists_months_summary_and_failures() {
        let now = Utc.with_ymd_and_hms(2024, 2, 20, 9, 0, 0).unwrap();
        let results = vec![
            (
                staff("Mina"),
                Ok(StaffDashboard {
                    staff: staff("Mina"),
                    snapshots: vec![snapshot(1, 2, 0, 1), snapshot(2, 0, 2, 2)],
                }),
            ),
            (
                staff("Jules"),
                Err(AggregateError::InvalidTimestamp {
                    field: "created_time",
                    value: "soon".to_string(),
                }),
            ),
        ];

        let report = build_report(now, chrono_tz::UTC, &results);

        assert!(report.starts_with("# Customer Care Dashboard"));
        assert!(report.contains("## Mina (mina@example.com)"));
        assert!(report.contains("| 01/2024 | 2 | 0 | 2 | 1 | 50.0% |"));
        assert!(report.contains("| 02/2024 | 0 | 2 | 2 | 2 | 100.0% |"));
        assert!(report.contains("| **Total (2 months)** | 2 | | 2 | 3 |"));
        assert!(report.contains("### Customer Types in 02/2024"));
        assert!(report.contains("## Skipped Staff"));
        assert!(report.contains("Jules (jules@example.com): invalid timestamp in created_time"));
    }

    #[test]
    fn roster_dates_follow_report_zone() {
        let now = Utc.with_ymd_and_hms(2024, 2, 20, 9, 0, 0).unwrap();
        let mut february = snapshot(2, 1, 0, 0);
        february.managed_students[0].assigned_at = Utc.with_ymd_and_hms(2024, 1, 31, 20, 0, 0).unwrap();
        let results = vec![(
            staff("Mina"),
            Ok(StaffDashboard {
                staff: staff("Mina"),
                snapshots: vec![february],
            }),
        )];

        let report = build_report(now, chrono_tz::Asia::Seoul, &results);

        assert!(report.contains("- Student 0 (assigned 2024-02-01)"));
        assert!(!report.contains("2024-01-31"));
    }

    #[test]
    fn empty_report_says_so() {
        let now = Utc.with_ymd_and_hms(2024, 2, 20, 9, 0, 0).unwrap();
        let report = build_report(now, chrono_tz::UTC, &[]);
        assert!(report.contains("No staff members found."));
    }

    #[test]
    fn csv_has_one_header_and_one_row_per_month() {
        let dashboards = vec![
            ("Mina".to_string(), vec![snapshot(1, 2, 0, 1), snapshot(2, 1, 2, 0)]),
            ("Jules".to_string(), vec![snapshot(2, 1, 0, 0)]),
        ];
        let mut buffer = Vec::new();
        write_csv(&mut buffer, &dashboards).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("staff,month,new,old,total,care_done,care_rate"));
        assert!(lines[1].starts_with("Mina,01/2024,2,0,2,1,50.0,"));
        assert!(lines[2].starts_with("Mina,02/2024,1,2,3,0,0.0,"));
        assert!(lines[3].starts_with("Jules,02/2024,1,0,1,0,0.0,"));
    }

    #[test]
    fn table_handles_empty_history() {
        assert!(render_table("Mina", &[]).contains("No assignments recorded."));
        let table = render_table("Mina", &[snapshot(3, 1, 0, 1)]);
        assert!(table.contains("03/2024"));
        assert!(table.contains("100.0%"));
    }
}
