use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use roster_common::eligibility::ensure_not_last_instructor;
use roster_common::error::{RosterError, RosterResult};
use roster_common::model::{
    validate_birth_date, validate_name, DepartmentId, GroupId, Instructor, InstructorId, Photo,
};
use roster_common::store::PgRoster;

use super::{
    enqueue_balance, lock_departments, lock_owner, AppState, DepartmentRef, Owned, RosterFilter,
};

const SELECT_INSTRUCTOR: &str = r#"
SELECT
    id, first_name, last_name, birth_date, employ_date, department_id, photo IS NOT NULL AS has_photo
FROM
    instructors
WHERE
    id = $1
"#;

#[derive(Deserialize, Debug)]
pub struct NewInstructor {
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub employ_date: Option<NaiveDate>,
    pub department_id: DepartmentId,
}

#[derive(Deserialize, Debug, Default)]
pub struct InstructorUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub employ_date: Option<NaiveDate>,
    pub department_id: Option<DepartmentId>,
}

#[derive(Serialize, Debug)]
pub struct InstructorSummary {
    pub id: InstructorId,
    pub first_name: String,
    pub last_name: String,
    pub department: DepartmentRef,
    pub groups: Vec<GroupId>,
}

#[derive(sqlx::FromRow)]
struct InstructorRow {
    id: InstructorId,
    first_name: String,
    last_name: String,
    department_id: DepartmentId,
    department_name: String,
    groups: Vec<GroupId>,
}

#[derive(Serialize, Debug)]
pub struct InstructorCard {
    #[serde(flatten)]
    pub instructor: Instructor,
    pub groups: Vec<GroupId>,
    pub photo_url: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<RosterFilter>,
) -> RosterResult<Json<Vec<InstructorSummary>>> {
    let departments = filter.departments()?;
    let groups = filter.groups()?;

    let base_query = r#"
SELECT
    i.id,
    i.first_name,
    i.last_name,
    i.department_id,
    d.name AS department_name,
    COALESCE(array_agg(g.id ORDER BY g.id) FILTER (WHERE g.id IS NOT NULL), '{}') AS groups
FROM
    instructors i
    JOIN departments d ON d.id = i.department_id
    LEFT JOIN groups g ON g.instructor_id = i.id
WHERE
    (cardinality($1::bigint[]) = 0 OR i.department_id = ANY($1))
    AND (cardinality($2::bigint[]) = 0 OR EXISTS (
        SELECT 1 FROM groups headed WHERE headed.instructor_id = i.id AND headed.id = ANY($2)
    ))
    AND ($3::text IS NULL OR i.first_name ILIKE '%' || $3 || '%')
    AND ($4::text IS NULL OR i.last_name ILIKE '%' || $4 || '%')
GROUP BY
    i.id, d.name
ORDER BY
    i.id
    "#;

    let rows: Vec<InstructorRow> = sqlx::query_as(base_query)
        .bind(&departments)
        .bind(&groups)
        .bind(filter.first_name())
        .bind(filter.last_name())
        .fetch_all(&state.pool)
        .await?;

    let instructors = rows
        .into_iter()
        .map(|row| InstructorSummary {
            id: row.id,
            first_name: row.first_name,
            last_name: row.last_name,
            department: DepartmentRef {
                id: row.department_id,
                name: row.department_name,
            },
            groups: row.groups,
        })
        .collect();

    Ok(Json(instructors))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<InstructorId>,
) -> RosterResult<Json<InstructorCard>> {
    let instructor: Option<Instructor> = sqlx::query_as(SELECT_INSTRUCTOR)
        .bind(id)
        .fetch_optional(&state.pool)
        .await?;
    let instructor = instructor.ok_or(RosterError::NotFound("instructor", id))?;

    let groups = sqlx::query_scalar("SELECT id FROM groups WHERE instructor_id = $1 ORDER BY id")
        .bind(id)
        .fetch_all(&state.pool)
        .await?;

    let photo_url = instructor
        .has_photo
        .then(|| format!("/instructors/{id}/photo"));

    Ok(Json(InstructorCard {
        instructor,
        groups,
        photo_url,
    }))
}

/// Hire an instructor. The department is rebalanced once the hire commits.
#[instrument(skip_all, fields(department_id = payload.department_id))]
pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<NewInstructor>,
) -> RosterResult<(StatusCode, Json<Instructor>)> {
    let first_name = validate_name("first_name", &payload.first_name)?;
    let last_name = validate_name("last_name", &payload.last_name)?;
    let today = Utc::now().date_naive();
    let birth_date = validate_birth_date(payload.birth_date, today)?;

    let mut tx = state.pool.begin().await?;
    lock_departments(&mut tx, &[payload.department_id]).await?;

    let base_query = r#"
INSERT INTO instructors
    (first_name, last_name, birth_date, employ_date, department_id)
VALUES
    ($1, $2, $3, COALESCE($4, CURRENT_DATE), $5)
RETURNING
    id, first_name, last_name, birth_date, employ_date, department_id, FALSE AS has_photo
    "#;
    let instructor: Instructor = sqlx::query_as(base_query)
        .bind(&first_name)
        .bind(&last_name)
        .bind(birth_date)
        .bind(payload.employ_date)
        .bind(payload.department_id)
        .fetch_one(&mut *tx)
        .await?;

    enqueue_balance(&mut tx, &state, &[payload.department_id]).await?;
    tx.commit().await?;

    info!(instructor_id = instructor.id, "hired instructor");
    Ok((StatusCode::CREATED, Json(instructor)))
}

/// Partial update. Moving an instructor to another department is refused when they are the
/// last instructor of a department that still has students.
#[instrument(skip_all, fields(instructor_id = id))]
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<InstructorId>,
    Json(payload): Json<InstructorUpdate>,
) -> RosterResult<Json<Instructor>> {
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
    let department_id = lock_owner(&mut tx, Owned::Instructor, id, payload.department_id).await?;
    let transfer_to = payload.department_id.filter(|target| *target != department_id);

    if transfer_to.is_some() {
        ensure_not_last_instructor(&mut PgRoster::new(&mut tx), department_id).await?;

        // Groups stay in their department; the balancer finds them a new instructor.
        sqlx::query("UPDATE groups SET instructor_id = NULL WHERE instructor_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }

    let base_query = r#"
UPDATE
    instructors
SET
    first_name = COALESCE($2, first_name),
    last_name = COALESCE($3, last_name),
    birth_date = COALESCE($4, birth_date),
    employ_date = COALESCE($5, employ_date),
    department_id = COALESCE($6, department_id)
WHERE
    id = $1
RETURNING
    id, first_name, last_name, birth_date, employ_date, department_id, photo IS NOT NULL AS has_photo
    "#;
    let instructor: Instructor = sqlx::query_as(base_query)
        .bind(id)
        .bind(&first_name)
        .bind(&last_name)
        .bind(birth_date)
        .bind(payload.employ_date)
        .bind(transfer_to)
        .fetch_one(&mut *tx)
        .await?;

    if let Some(target) = transfer_to {
        enqueue_balance(&mut tx, &state, &[department_id, target]).await?;
    }
    tx.commit().await?;

    info!(transferred_to = transfer_to, "updated instructor");
    Ok(Json(instructor))
}

/// Fire an instructor. Refused for the last instructor of a department with students.
#[instrument(skip_all, fields(instructor_id = id))]
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<InstructorId>,
) -> RosterResult<StatusCode> {
    let mut tx = state.pool.begin().await?;
    let department_id = lock_owner(&mut tx, Owned::Instructor, id, None).await?;

    ensure_not_last_instructor(&mut PgRoster::new(&mut tx), department_id).await?;

    sqlx::query("DELETE FROM instructors WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    enqueue_balance(&mut tx, &state, &[department_id]).await?;
    tx.commit().await?;

    info!(department_id, "fired instructor");
    Ok(StatusCode::NO_CONTENT)
}

/// Store the raw request body as the photo, with its `Content-Type` as mime type.
pub async fn upload_photo(
    State(state): State<AppState>,
    Path(id): Path<InstructorId>,
    headers: HeaderMap,
    body: Bytes,
) -> RosterResult<StatusCode> {
    if body.is_empty() {
        return Err(RosterError::Validation("photo must not be empty".to_owned()));
    }
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let result = sqlx::query("UPDATE instructors SET photo = $2, photo_mime = $3 WHERE id = $1")
        .bind(id)
        .bind(body.as_ref())
        .bind(mime)
        .execute(&state.pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(RosterError::NotFound("instructor", id));
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_photo(
    State(state): State<AppState>,
    Path(id): Path<InstructorId>,
) -> RosterResult<impl IntoResponse> {
    let photo: Option<Photo> = sqlx::query_as(
        "SELECT photo, photo_mime FROM instructors WHERE id = $1 AND photo IS NOT NULL",
    )
    .bind(id)
    .fetch_optional(&state.pool)
    .await?;
    let photo = photo.ok_or(RosterError::NotFound("photo of instructor", id))?;

    Ok(([(header::CONTENT_TYPE, photo.mime().to_owned())], photo.photo))
}
