use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::{info, instrument};

use roster_common::error::{RosterError, RosterResult};
use roster_common::model::{validate_name, Department, DepartmentId};

use super::{lock_departments, AppState};

#[derive(Deserialize, Debug)]
pub struct NewDepartment {
    pub name: String,
}

pub async fn list(State(state): State<AppState>) -> RosterResult<Json<Vec<Department>>> {
    let departments = sqlx::query_as("SELECT id, name FROM departments ORDER BY id")
        .fetch_all(&state.pool)
        .await?;

    Ok(Json(departments))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<DepartmentId>,
) -> RosterResult<Json<Department>> {
    let department: Option<Department> =
        sqlx::query_as("SELECT id, name FROM departments WHERE id = $1")
            .bind(id)
            .fetch_optional(&state.pool)
            .await?;

    department
        .map(Json)
        .ok_or(RosterError::NotFound("department", id))
}

#[instrument(skip_all)]
pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<NewDepartment>,
) -> RosterResult<(StatusCode, Json<Department>)> {
    let name = validate_name("name", &payload.name)?;

    let department: Department =
        sqlx::query_as("INSERT INTO departments (name) VALUES ($1) RETURNING id, name")
            .bind(&name)
            .fetch_one(&state.pool)
            .await?;

    info!(department_id = department.id, "created department");
    Ok((StatusCode::CREATED, Json(department)))
}

/// Only an empty department can be removed. Groups left over from its last students go with it.
#[instrument(skip_all, fields(department_id = id))]
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<DepartmentId>,
) -> RosterResult<StatusCode> {
    let mut tx = state.pool.begin().await?;
    lock_departments(&mut tx, &[id]).await?;

    let base_query = r#"
SELECT
    (SELECT COUNT(*) FROM instructors WHERE department_id = $1),
    (SELECT COUNT(*) FROM students WHERE department_id = $1),
    (SELECT COUNT(*) FROM subjects WHERE department_id = $1)
    "#;
    let (instructors, students, subjects): (i64, i64, i64) = sqlx::query_as(base_query)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

    if instructors + students + subjects > 0 {
        return Err(RosterError::Conflict(format!(
            "department {id} still has {instructors} instructors, {students} students and {subjects} subjects"
        )));
    }

    sqlx::query("DELETE FROM groups WHERE department_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM departments WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!("deleted department");
    Ok(StatusCode::NO_CONTENT)
}
