use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Serialize;

use roster_common::error::{RosterError, RosterResult};
use roster_common::model::{DepartmentId, GroupId, InstructorId, StudentId};

use super::{AppState, RosterFilter};

/// Groups are read-only here: they are created, staffed and removed by the balancer.
#[derive(Serialize, Debug, sqlx::FromRow)]
pub struct GroupView {
    pub id: GroupId,
    pub department_id: DepartmentId,
    pub instructor_id: Option<InstructorId>,
    pub students: Vec<StudentId>,
}

const SELECT_GROUPS: &str = r#"
SELECT
    g.id,
    g.department_id,
    g.instructor_id,
    COALESCE(array_agg(s.id ORDER BY s.id) FILTER (WHERE s.id IS NOT NULL), '{}') AS students
FROM
    groups g
    LEFT JOIN students s ON s.group_id = g.id
"#;

pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<RosterFilter>,
) -> RosterResult<Json<Vec<GroupView>>> {
    let departments = filter.departments()?;

    let query = format!(
        "{SELECT_GROUPS} WHERE cardinality($1::bigint[]) = 0 OR g.department_id = ANY($1) GROUP BY g.id ORDER BY g.id"
    );
    let groups = sqlx::query_as(&query)
        .bind(&departments)
        .fetch_all(&state.pool)
        .await?;

    Ok(Json(groups))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<GroupId>,
) -> RosterResult<Json<GroupView>> {
    let query = format!("{SELECT_GROUPS} WHERE g.id = $1 GROUP BY g.id");
    let group: Option<GroupView> = sqlx::query_as(&query)
        .bind(id)
        .fetch_optional(&state.pool)
        .await?;

    group.map(Json).ok_or(RosterError::NotFound("group", id))
}
