use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::{info, instrument};

use roster_common::error::{RosterError, RosterResult};
use roster_common::model::{validate_name, DepartmentId, Subject, SubjectId};

use super::{lock_departments, AppState, RosterFilter};

#[derive(Deserialize, Debug)]
pub struct NewSubject {
    pub name: String,
    pub department_id: DepartmentId,
}

pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<RosterFilter>,
) -> RosterResult<Json<Vec<Subject>>> {
    let departments = filter.departments()?;

    let base_query = r#"
SELECT
    id, name, department_id
FROM
    subjects
WHERE
    cardinality($1::bigint[]) = 0 OR department_id = ANY($1)
ORDER BY
    id
    "#;
    let subjects = sqlx::query_as(base_query)
        .bind(&departments)
        .fetch_all(&state.pool)
        .await?;

    Ok(Json(subjects))
}

/// Every student of the department gets an unset mark for the new subject.
#[instrument(skip_all, fields(department_id = payload.department_id))]
pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<NewSubject>,
) -> RosterResult<(StatusCode, Json<Subject>)> {
    let name = validate_name("name", &payload.name)?;

    let mut tx = state.pool.begin().await?;
    lock_departments(&mut tx, &[payload.department_id]).await?;

    let subject: Subject = sqlx::query_as(
        "INSERT INTO subjects (name, department_id) VALUES ($1, $2) RETURNING id, name, department_id",
    )
    .bind(&name)
    .bind(payload.department_id)
    .fetch_one(&mut *tx)
    .await?;

    let marks = sqlx::query(
        "INSERT INTO student_subjects (student_id, subject_id) SELECT id, $1 FROM students WHERE department_id = $2",
    )
    .bind(subject.id)
    .bind(payload.department_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(
        subject_id = subject.id,
        marks = marks.rows_affected(),
        "created subject"
    );
    Ok((StatusCode::CREATED, Json(subject)))
}

/// Removes the subject together with every mark recorded for it.
#[instrument(skip_all, fields(subject_id = id))]
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<SubjectId>,
) -> RosterResult<StatusCode> {
    let result = sqlx::query("DELETE FROM subjects WHERE id = $1")
        .bind(id)
        .execute(&state.pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(RosterError::NotFound("subject", id));
    }

    info!("deleted subject");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use sqlx::PgPool;

    use crate::handlers::test_support::{app, json, offline_app, send};

    #[tokio::test]
    async fn list_rejects_malformed_filter() {
        let app = offline_app();

        let response = send(&app, Method::GET, "/subjects?d=1,x", None).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a postgres server at DATABASE_URL"]
    async fn create_in_missing_department(db: PgPool) {
        let app = app(db);

        let response = send(
            &app,
            Method::POST,
            "/subjects",
            Some(json!({"name": "Optics", "department_id": 404})),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a postgres server at DATABASE_URL"]
    async fn list_filters_by_department(db: PgPool) {
        let app = app(db);

        let mut departments = Vec::new();
        for name in ["Physics", "History"] {
            let department = json(
                send(&app, Method::POST, "/departments", Some(json!({"name": name}))).await,
            )
            .await;
            departments.push(department["id"].as_i64().unwrap());
        }

        for (name, department_id) in [("Optics", departments[0]), ("Antiquity", departments[1])] {
            let response = send(
                &app,
                Method::POST,
                "/subjects",
                Some(json!({"name": name, "department_id": department_id})),
            )
            .await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let uri = format!("/subjects?d={}", departments[1]);
        let subjects = json(send(&app, Method::GET, &uri, None).await).await;
        assert_eq!(subjects.as_array().unwrap().len(), 1);
        assert_eq!(subjects[0]["name"], "Antiquity");

        let all = json(send(&app, Method::GET, "/subjects", None).await).await;
        assert_eq!(all.as_array().unwrap().len(), 2);
    }
}
