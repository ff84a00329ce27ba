use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;
use tracing::{info, instrument};

use roster_common::eligibility::ensure_department_has_instructor;
use roster_common::error::{RosterError, RosterResult};
use roster_common::model::{
    validate_birth_date, validate_mark, validate_name, DepartmentId, GroupId, Photo, Student,
    StudentId, StudentMark, SubjectId,
};
use roster_common::store::PgRoster;

use super::{
    enqueue_balance, lock_departments, lock_owner, AppState, DepartmentRef, Owned, RosterFilter,
};

const SELECT_STUDENT: &str = r#"
SELECT
    id, first_name, last_name, birth_date, enroll_date, department_id, group_id, photo IS NOT NULL AS has_photo
FROM
    students
WHERE
    id = $1
"#;

#[derive(Deserialize, Debug)]
pub struct NewStudent {
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub enroll_date: Option<NaiveDate>,
    pub department_id: DepartmentId,
}

#[derive(Deserialize, Debug, Default)]
pub struct StudentUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub enroll_date: Option<NaiveDate>,
    pub department_id: Option<DepartmentId>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct MarkUpdate {
    pub subject_id: SubjectId,
    pub mark: Option<i32>,
}

#[derive(Serialize, Debug)]
pub struct StudentSummary {
    pub id: StudentId,
    pub first_name: String,
    pub last_name: String,
    pub department: DepartmentRef,
    pub group: Option<GroupId>,
}

#[derive(sqlx::FromRow)]
struct StudentRow {
    id: StudentId,
    first_name: String,
    last_name: String,
    department_id: DepartmentId,
    department_name: String,
    group_id: Option<GroupId>,
}

#[derive(Serialize, Debug)]
pub struct StudentCard {
    #[serde(flatten)]
    pub student: Student,
    pub marks: Vec<StudentMark>,
    pub photo_url: Option<String>,
}

async fn marks_of(conn: &mut PgConnection, id: StudentId) -> RosterResult<Vec<StudentMark>> {
    let base_query = r#"
SELECT
    s.id AS subject_id, s.name AS subject_name, ss.mark
FROM
    student_subjects ss
    JOIN subjects s ON s.id = ss.subject_id
WHERE
    ss.student_id = $1
ORDER BY
    s.id
    "#;

    let marks = sqlx::query_as(base_query)
        .bind(id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(marks)
}

/// One unset mark per subject of the student's department.
async fn create_mark_rows(
    conn: &mut PgConnection,
    id: StudentId,
    department_id: DepartmentId,
) -> RosterResult<u64> {
    let result = sqlx::query(
        "INSERT INTO student_subjects (student_id, subject_id) SELECT $1, id FROM subjects WHERE department_id = $2",
    )
    .bind(id)
    .bind(department_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<RosterFilter>,
) -> RosterResult<Json<Vec<StudentSummary>>> {
    let departments = filter.departments()?;
    let groups = filter.groups()?;

    let base_query = r#"
SELECT
    s.id, s.first_name, s.last_name, s.department_id, d.name AS department_name, s.group_id
FROM
    students s
    JOIN departments d ON d.id = s.department_id
WHERE
    (cardinality($1::bigint[]) = 0 OR s.department_id = ANY($1))
    AND (cardinality($2::bigint[]) = 0 OR s.group_id = ANY($2))
    AND ($3::text IS NULL OR s.first_name ILIKE '%' || $3 || '%')
    AND ($4::text IS NULL OR s.last_name ILIKE '%' || $4 || '%')
ORDER BY
    s.id
    "#;

    let rows: Vec<StudentRow> = sqlx::query_as(base_query)
        .bind(&departments)
        .bind(&groups)
        .bind(filter.first_name())
        .bind(filter.last_name())
        .fetch_all(&state.pool)
        .await?;

    let students = rows
        .into_iter()
        .map(|row| StudentSummary {
            id: row.id,
            first_name: row.first_name,
            last_name: row.last_name,
            department: DepartmentRef {
                id: row.department_id,
                name: row.department_name,
            },
            group: row.group_id,
        })
        .collect();

    Ok(Json(students))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<StudentId>,
) -> RosterResult<Json<StudentCard>> {
    let mut conn = state.pool.acquire().await?;

    let student: Option<Student> = sqlx::query_as(SELECT_STUDENT)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    let student = student.ok_or(RosterError::NotFound("student", id))?;
    let marks = marks_of(&mut conn, id).await?;
    let photo_url = student.has_photo.then(|| format!("/students/{id}/photo"));

    Ok(Json(StudentCard {
        student,
        marks,
        photo_url,
    }))
}

/// Enroll a student. Refused when the department has no instructor to teach them.
#[instrument(skip_all, fields(department_id = payload.department_id))]
pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<NewStudent>,
) -> RosterResult<(StatusCode, Json<Student>)> {
    let first_name = validate_name("first_name", &payload.first_name)?;
    let last_name = validate_name("last_name", &payload.last_name)?;
    let today = Utc::now().date_naive();
    let birth_date = validate_birth_date(payload.birth_date, today)?;

    let mut tx = state.pool.begin().await?;
    lock_departments(&mut tx, &[payload.department_id]).await?;
    ensure_department_has_instructor(&mut PgRoster::new(&mut tx), payload.department_id).await?;

    let base_query = r#"
INSERT INTO students
    (first_name, last_name, birth_date, enroll_date, department_id)
VALUES
    ($1, $2, $3, COALESCE($4, CURRENT_DATE), $5)
RETURNING
    id, first_name, last_name, birth_date, enroll_date, department_id, group_id, FALSE AS has_photo
    "#;
    let student: Student = sqlx::query_as(base_query)
        .bind(&first_name)
        .bind(&last_name)
        .bind(birth_date)
        .bind(payload.enroll_date)
        .bind(payload.department_id)
        .fetch_one(&mut *tx)
        .await?;

    let marks = create_mark_rows(&mut tx, student.id, payload.department_id).await?;
    enqueue_balance(&mut tx, &state, &[payload.department_id]).await?;
    tx.commit().await?;

    info!(student_id = student.id, marks, "enrolled student");
    Ok((StatusCode::CREATED, Json(student)))
}

/// Partial update. A transfer needs an instructor in the target department, drops the student's
/// group and replaces their marks with unset marks for the new department's subjects.
#[instrument(skip_all, fields(student_id = id))]
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<StudentId>,
    Json(payload): Json<StudentUpdate>,
) -> RosterResult<Json<Student>> {
    let first_name = payload
        .first_name
        .as_deref()
        .map(|value| validate_name("first_name", value))
        .transpose()?;
    let last_name = payload
        .last_name
        .as_deref()
        .map(|value| validate_name("last_name", value))
        .transpose()?;
    let today = Utc::now().date_naive();
    let birth_date = payload
        .birth_date
        .map(|value| validate_birth_date(value, today))
        .transpose()?;

    let mut tx = state.pool.begin().await?;
    let department_id = lock_owner(&mut tx, Owned::Student, id, payload.department_id).await?;
    let transfer_to = payload.department_id.filter(|target| *target != department_id);

    if let Some(target) = transfer_to {
        ensure_department_has_instructor(&mut PgRoster::new(&mut tx), target).await?;
    }

    let base_query = r#"
UPDATE
    students
SET
    first_name = COALESCE($2, first_name),
    last_name = COALESCE($3, last_name),
    birth_date = COALESCE($4, birth_date),
    enroll_date = COALESCE($5, enroll_date),
    department_id = COALESCE($6, department_id),
    group_id = CASE WHEN $6 IS NULL THEN group_id ELSE NULL END
WHERE
    id = $1
RETURNING
    id, first_name, last_name, birth_date, enroll_date, department_id, group_id, photo IS NOT NULL AS has_photo
    "#;
    let student: Student = sqlx::query_as(base_query)
        .bind(id)
        .bind(&first_name)
        .bind(&last_name)
        .bind(birth_date)
        .bind(payload.enroll_date)
        .bind(transfer_to)
        .fetch_one(&mut *tx)
        .await?;

    if let Some(target) = transfer_to {
        sqlx::query("DELETE FROM student_subjects WHERE student_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        create_mark_rows(&mut tx, id, target).await?;
        enqueue_balance(&mut tx, &state, &[department_id, target]).await?;
    }
    tx.commit().await?;

    info!(transferred_to = transfer_to, "updated student");
    Ok(Json(student))
}

/// Withdraw a student. Their marks go with them.
#[instrument(skip_all, fields(student_id = id))]
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<StudentId>,
) -> RosterResult<StatusCode> {
    let mut tx = state.pool.begin().await?;
    let department_id = lock_owner(&mut tx, Owned::Student, id, None).await?;

    sqlx::query("DELETE FROM students WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    enqueue_balance(&mut tx, &state, &[department_id]).await?;
    tx.commit().await?;

    info!(department_id, "withdrew student");
    Ok(StatusCode::NO_CONTENT)
}

/// Set marks for subjects the student already has a mark record for. Every mark is checked
/// before anything is written.
#[instrument(skip_all, fields(student_id = id))]
pub async fn update_marks(
    State(state): State<AppState>,
    Path(id): Path<StudentId>,
    Json(payload): Json<Vec<MarkUpdate>>,
) -> RosterResult<Json<Vec<StudentMark>>> {
    for update in &payload {
        validate_mark(update.mark)?;
    }

    let mut tx = state.pool.begin().await?;

    let exists: Option<StudentId> = sqlx::query_scalar("SELECT id FROM students WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    if exists.is_none() {
        return Err(RosterError::NotFound("student", id));
    }

    for update in &payload {
        let result = sqlx::query(
            "UPDATE student_subjects SET mark = $3 WHERE student_id = $1 AND subject_id = $2",
        )
        .bind(id)
        .bind(update.subject_id)
        .bind(update.mark)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RosterError::Validation(format!(
                "student {id} does not study subject {}",
                update.subject_id
            )));
        }
    }

    let marks = marks_of(&mut tx, id).await?;
    tx.commit().await?;

    Ok(Json(marks))
}

/// Store the raw request body as the photo, with its `Content-Type` as mime type.
pub async fn upload_photo(
    State(state): State<AppState>,
    Path(id): Path<StudentId>,
    headers: HeaderMap,
    body: Bytes,
) -> RosterResult<StatusCode> {
    if body.is_empty() {
        return Err(RosterError::Validation("photo must not be empty".to_owned()));
    }
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let result = sqlx::query("UPDATE students SET photo = $2, photo_mime = $3 WHERE id = $1")
        .bind(id)
        .bind(body.as_ref())
        .bind(mime)
        .execute(&state.pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(RosterError::NotFound("student", id));
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_photo(
    State(state): State<AppState>,
    Path(id): Path<StudentId>,
) -> RosterResult<impl IntoResponse> {
    let photo: Option<Photo> = sqlx::query_as(
        "SELECT photo, photo_mime FROM students WHERE id = $1 AND photo IS NOT NULL",
    )
    .bind(id)
    .fetch_optional(&state.pool)
    .await?;
    let photo = photo.ok_or(RosterError::NotFound("photo of student", id))?;

    Ok(([(header::CONTENT_TYPE, photo.mime().to_owned())], photo.photo))
}
