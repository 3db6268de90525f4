use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::models::{
    AssignmentEvent, CareInteraction, CourseMemo, CustomerType, EscalationReport, ReportLevel,
    StaffRef, StudentRecord,
};
use crate::payload;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn ts(year: i32, month: u32, day: u32) -> anyhow::Result<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, day, 9, 0, 0)
        .single()
        .context("invalid date")
}

fn seed_student(id: &str, name: &str) -> anyhow::Result<StudentRecord> {
    Ok(StudentRecord {
        id: Uuid::parse_str(id)?,
        name: name.to_string(),
        care_interactions: Vec::new(),
        course_memos: Vec::new(),
        escalation_reports: Vec::new(),
    })
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<usize> {
    let mina = StaffRef {
        id: Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
        name: "Mina Cho".to_string(),
        email: "mina.cho@example.com".to_string(),
    };
    let jules = StaffRef {
        id: Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
        name: "Jules Moreno".to_string(),
        email: "jules.moreno@example.com".to_string(),
    };

    let mut avery = seed_student("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2", "Avery Lee")?;
    avery.care_interactions.push(CareInteraction {
        occurred_at: ts(2026, 7, 14)?,
        kind: Some("call".to_string()),
        watched_video: true,
        customer_type: CustomerType::New,
    });
    avery.course_memos.push(CourseMemo {
        created_at: ts(2026, 8, 30)?,
        teacher_note: Some("Completed speaking course, ready for level 3".to_string()),
    });

    let mut kiara = seed_student("6b1e0f4c-8e3a-4d8f-9a7e-2f6d1c3b5a90", "Kiara Patel")?;
    kiara.care_interactions.push(CareInteraction {
        occurred_at: ts(2026, 9, 2)?,
        kind: None,
        watched_video: false,
        customer_type: CustomerType::Warning,
    });
    kiara.escalation_reports.push(EscalationReport {
        created_at: ts(2026, 9, 5)?,
        level: ReportLevel::Hot,
    });
    kiara.course_memos.push(CourseMemo {
        created_at: ts(2026, 9, 28)?,
        teacher_note: None,
    });

    let mut noah = seed_student("9f2c7a1d-4b6e-4e21-8c3f-7a5d9e0b1c24", "Noah Kim")?;
    noah.care_interactions.push(CareInteraction {
        occurred_at: ts(2026, 10, 3)?,
        kind: Some("message".to_string()),
        watched_video: false,
        customer_type: CustomerType::Vip,
    });
    noah.escalation_reports.push(EscalationReport {
        created_at: ts(2026, 10, 6)?,
        level: ReportLevel::Normal,
    });

    let assignments = vec![
        (&mina, ts(2026, 6, 20)?, avery),
        (&mina, ts(2026, 9, 1)?, kiara),
        (&jules, ts(2026, 8, 11)?, noah),
    ];

    let mut tx = pool.begin().await?;
    let mina_id = upsert_staff(&mut tx, &mina).await?;
    let jules_id = upsert_staff(&mut tx, &jules).await?;

    let mut inserted = 0usize;
    for (staff, assigned_at, student) in assignments {
        let staff_id = if staff.email == mina.email { mina_id } else { jules_id };
        let event = AssignmentEvent {
            assigned_at,
            student,
        };
        if insert_assignment(&mut tx, staff_id, &event).await? {
            inserted += 1;
        }
    }
    tx.commit().await?;

    Ok(inserted)
}

/// Converts every staff member of an export, rejecting the whole file on the first bad timestamp.
pub fn stage_import(
    payloads: &[payload::StaffPayload],
    tz: Tz,
) -> anyhow::Result<Vec<(StaffRef, Vec<AssignmentEvent>)>> {
    payloads
        .iter()
        .map(|payload| {
            let events = payload
                .to_events(tz)
                .with_context(|| format!("rejecting export for {}", payload.staff_email))?;
            Ok((payload.staff(), events))
        })
        .collect()
}

/// Imports a reporting API export in one transaction, after every staff member has been validated.
pub async fn import_json(pool: &PgPool, json_path: &std::path::Path, tz: Tz) -> anyhow::Result<usize> {
    let payloads = payload::read_payloads(json_path)?;
    let staged = stage_import(&payloads, tz)?;

    let mut tx = pool.begin().await?;
    let mut inserted = 0usize;
    for (staff, events) in staged {
        let staff_id = upsert_staff(&mut tx, &staff).await?;
        for event in events.iter() {
            if insert_assignment(&mut tx, staff_id, event).await? {
                inserted += 1;
            }
        }
        tracing::debug!(staff = %staff.email, assignments = events.len(), "staged staff export");
    }
    tx.commit().await.context("failed to commit import")?;

    Ok(inserted)
}

/// Returns the stored id, which wins over the export's id when the email is already known.
async fn upsert_staff(conn: &mut PgConnection, staff: &StaffRef) -> anyhow::Result<Uuid> {
    let renamed: Option<Uuid> = sqlx::query(
        r#"
        UPDATE care_dashboard.staff
        SET full_name = $2, email = $3
        WHERE id = $1
          AND NOT EXISTS (SELECT 1 FROM care_dashboard.staff WHERE email = $3)
        RETURNING id
        "#,
    )
    .bind(staff.id)
    .bind(&staff.name)
    .bind(&staff.email)
    .fetch_optional(&mut *conn)
    .await?
    .map(|row| row.get("id"));

    if let Some(id) = renamed {
        return Ok(id);
    }

    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO care_dashboard.staff (id, full_name, email)
        VALUES ($1, $2, $3)
        ON CONFLICT (email) DO UPDATE
        SET full_name = EXCLUDED.full_name
        RETURNING id
        "#,
    )
    .bind(staff.id)
    .bind(&staff.name)
    .bind(&staff.email)
    .fetch_one(&mut *conn)
    .await?
    .get("id");

    Ok(id)
}

/// Stable per-record keys: the timestamp plus how many earlier records share it.
pub fn activity_keys<I>(prefix: &str, student_id: Uuid, timestamps: I) -> Vec<String>
where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    let mut seen: HashMap<DateTime<Utc>, usize> = HashMap::new();
    timestamps
        .into_iter()
        .map(|at| {
            let occurrence = seen.entry(at).or_insert(0);
            let key = format!("{prefix}:{student_id}:{}:{occurrence}", at.to_rfc3339());
            *occurrence += 1;
            key
        })
        .collect()
}

/// Returns whether a new assignment row was written; student activity is upserted either way.
async fn insert_assignment(
    conn: &mut PgConnection,
    staff_id: Uuid,
    event: &AssignmentEvent,
) -> anyhow::Result<bool> {
    let student = &event.student;

    sqlx::query(
        r#"
        INSERT INTO care_dashboard.students (id, full_name)
        VALUES ($1, $2)
        ON CONFLICT (id) DO UPDATE
        SET full_name = EXCLUDED.full_name
        "#,
    )
    .bind(student.id)
    .bind(&student.name)
    .execute(&mut *conn)
    .await?;

    let result = sqlx::query(
        r#"
        INSERT INTO care_dashboard.assignments
        (id, staff_id, student_id, assigned_at, source_key)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(staff_id)
    .bind(student.id)
    .bind(event.assigned_at)
    .bind(format!("{staff_id}:{}:{}", student.id, event.assigned_at.to_rfc3339()))
    .execute(&mut *conn)
    .await?;

    let care_keys = activity_keys(
        "care",
        student.id,
        student.care_interactions.iter().map(|care| care.occurred_at),
    );
    for (care, source_key) in student.care_interactions.iter().zip(care_keys) {
        sqlx::query(
            r#"
            INSERT INTO care_dashboard.care_interactions
            (id, student_id, occurred_at, kind, watched_video, customer_type, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source_key) DO UPDATE
            SET kind = EXCLUDED.kind,
                watched_video = EXCLUDED.watched_video,
                customer_type = EXCLUDED.customer_type
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student.id)
        .bind(care.occurred_at)
        .bind(care.kind.as_deref())
        .bind(care.watched_video)
        .bind(care.customer_type.stored_label())
        .bind(source_key)
        .execute(&mut *conn)
        .await?;
    }

    let memo_keys = activity_keys(
        "memo",
        student.id,
        student.course_memos.iter().map(|memo| memo.created_at),
    );
    for (memo, source_key) in student.course_memos.iter().zip(memo_keys) {
        sqlx::query(
            r#"
            INSERT INTO care_dashboard.course_memos
            (id, student_id, created_at, teacher_note, source_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_key) DO UPDATE
            SET teacher_note = EXCLUDED.teacher_note
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student.id)
        .bind(memo.created_at)
        .bind(memo.teacher_note.as_deref())
        .bind(source_key)
        .execute(&mut *conn)
        .await?;
    }

    let report_keys = activity_keys(
        "report",
        student.id,
        student.escalation_reports.iter().map(|report| report.created_at),
    );
    for (report, source_key) in student.escalation_reports.iter().zip(report_keys) {
        sqlx::query(
            r#"
            INSERT INTO care_dashboard.escalation_reports
            (id, student_id, created_at, level, source_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_key) DO UPDATE
            SET level = EXCLUDED.level
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student.id)
        .bind(report.created_at)
        .bind(report.level.label())
        .bind(source_key)
        .execute(&mut *conn)
        .await?;
    }

    Ok(result.rows_affected() > 0)
}

pub async fn fetch_staff(pool: &PgPool) -> anyhow::Result<Vec<StaffRef>> {
    let rows = sqlx::query(
        "SELECT id, full_name, email FROM care_dashboard.staff ORDER BY full_name",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| StaffRef {
            id: row.get("id"),
            name: row.get("full_name"),
            email: row.get("email"),
        })
        .collect())
}

pub async fn fetch_staff_by_email(pool: &PgPool, email: &str) -> anyhow::Result<StaffRef> {
    let row = sqlx::query("SELECT id, full_name, email FROM care_dashboard.staff WHERE email = $1")
        .bind(email)
        .fetch_optional(pool)
        .await?
        .with_context(|| format!("no staff member with email {email}"))?;

    Ok(StaffRef {
        id: row.get("id"),
        name: row.get("full_name"),
        email: row.get("email"),
    })
}

/// Loads every assignment for one staff member with each student's full activity history.
pub async fn fetch_assignment_events(
    pool: &PgPool,
    staff_id: Uuid,
) -> anyhow::Result<Vec<AssignmentEvent>> {
    let assignment_rows = sqlx::query(
        "SELECT a.assigned_at, st.id AS student_id, st.full_name \
         FROM care_dashboard.assignments a \
         JOIN care_dashboard.students st ON st.id = a.student_id \
         WHERE a.staff_id = $1",
    )
    .bind(staff_id)
    .fetch_all(pool)
    .await?;

    let mut students: HashMap<Uuid, StudentRecord> = HashMap::new();
    let mut assigned: Vec<(DateTime<Utc>, Uuid)> = Vec::new();
    for row in assignment_rows {
        let student_id: Uuid = row.get("student_id");
        students.entry(student_id).or_insert_with(|| StudentRecord {
            id: student_id,
            name: row.get("full_name"),
            care_interactions: Vec::new(),
            course_memos: Vec::new(),
            escalation_reports: Vec::new(),
        });
        assigned.push((row.get("assigned_at"), student_id));
    }

    if assigned.is_empty() {
        return Ok(Vec::new());
    }

    let student_ids: Vec<Uuid> = students.keys().copied().collect();

    let care_rows = sqlx::query(
        "SELECT student_id, occurred_at, kind, watched_video, customer_type \
         FROM care_dashboard.care_interactions \
         WHERE student_id = ANY($1) ORDER BY occurred_at",
    )
    .bind(&student_ids)
    .fetch_all(pool)
    .await?;
    for row in care_rows {
        let student_id: Uuid = row.get("student_id");
        let customer_type: Option<String> = row.get("customer_type");
        if let Some(student) = students.get_mut(&student_id) {
            student.care_interactions.push(CareInteraction {
                occurred_at: row.get("occurred_at"),
                kind: row.get("kind"),
                watched_video: row.get("watched_video"),
                customer_type: CustomerType::from_label(customer_type.as_deref()),
            });
        }
    }

    let memo_rows = sqlx::query(
        "SELECT student_id, created_at, teacher_note \
         FROM care_dashboard.course_memos \
         WHERE student_id = ANY($1) ORDER BY created_at",
    )
    .bind(&student_ids)
    .fetch_all(pool)
    .await?;
    for row in memo_rows {
        let student_id: Uuid = row.get("student_id");
        if let Some(student) = students.get_mut(&student_id) {
            student.course_memos.push(CourseMemo {
                created_at: row.get("created_at"),
                teacher_note: row.get("teacher_note"),
            });
        }
    }

    let report_rows = sqlx::query(
        "SELECT student_id, created_at, level \
         FROM care_dashboard.escalation_reports \
         WHERE student_id = ANY($1) ORDER BY created_at",
    )
    .bind(&student_ids)
    .fetch_all(pool)
    .await?;
    for row in report_rows {
        let student_id: Uuid = row.get("student_id");
        let level: String = row.get("level");
        if let Some(student) = students.get_mut(&student_id) {
            student.escalation_reports.push(EscalationReport {
                created_at: row.get("created_at"),
                level: ReportLevel::from_label(&level),
            });
        }
    }

    let mut events = Vec::with_capacity(assigned.len());
    for (assigned_at, student_id) in assigned {
        let student = students
            .get(&student_id)
            .cloned()
            .with_context(|| format!("student {student_id} vanished while loading"))?;
        events.push(AssignmentEvent {
            assigned_at,
            student,
        });
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn same_instant_records_get_distinct_keys() {
        let student_id = Uuid::new_v4();
        let keys = activity_keys("report", student_id, [at(5, 9), at(5, 9), at(6, 9)]);

        assert_eq!(keys.len(), 3);
        assert_ne!(keys[0], keys[1]);
        assert!(keys[0].ends_with(":0"));
        assert!(keys[1].ends_with(":1"));
        assert!(keys[2].ends_with(":0"));
    }

    #[test]
    fn keys_survive_reordering_across_timestamps() {
        let student_id = Uuid::new_v4();
        let forward = activity_keys("care", student_id, [at(1, 9), at(2, 9)]);
        let backward = activity_keys("care", student_id, [at(2, 9), at(1, 9)]);

        assert_eq!(forward[0], backward[1]);
        assert_eq!(forward[1], backward[0]);
    }

    #[test]
    fn completing_a_pending_interaction_keeps_its_key() {
        let pending: payload::StaffPayload = serde_json::from_value(json!({
            "staff_id": "3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2",
            "staff_name": "Mina Cho",
            "staff_email": "mina.cho@example.com",
            "assignments": [{
                "created_time": "2024-03-01T09:00:00Z",
                "student": {
                    "id": "0c22f1f1-9184-4fd4-9b21-28c68a6a89dc",
                    "name": "Avery Lee",
                    "customer_care": [{"created_time": "2024-03-04T09:00:00Z", "type": null}]
                }
            }]
        }))
        .unwrap();
        let mut performed = pending.clone();
        performed.assignments[0].student.customer_care[0].kind = Some("call".to_string());

        let key_of = |payload: &payload::StaffPayload| {
            let staged = stage_import(std::slice::from_ref(payload), chrono_tz::UTC).unwrap();
            let student = &staged[0].1[0].student;
            activity_keys(
                "care",
                student.id,
                student.care_interactions.iter().map(|care| care.occurred_at),
            )
        };

        assert_eq!(key_of(&pending), key_of(&performed));
    }

    #[test]
    fn staging_rejects_whole_file_on_one_bad_timestamp() {
        let good: payload::StaffPayload = serde_json::from_value(json!({
            "staff_id": "3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2",
            "staff_name": "Mina Cho",
            "staff_email": "mina.cho@example.com",
            "assignments": [{
                "created_time": "2024-03-01T09:00:00Z",
                "student": {"id": "0c22f1f1-9184-4fd4-9b21-28c68a6a89dc", "name": "Avery Lee"}
            }]
        }))
        .unwrap();
        let mut bad = good.clone();
        bad.staff_email = "jules.moreno@example.com".to_string();
        bad.assignments[0].created_time = "someday".to_string();

        let err = stage_import(&[good.clone(), bad], chrono_tz::UTC).unwrap_err();
        assert!(err.to_string().contains("jules.moreno@example.com"));
        assert_eq!(stage_import(&[good], chrono_tz::UTC).unwrap().len(), 1);
    }
}
