use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnection, PgPool};
use tracing::debug;

use roster_common::error::{RosterError, RosterResult};
use roster_common::model::DepartmentId;
use roster_common::pgqueue::{BalanceQueue, NewBalanceJob};
use roster_common::store::{PgRoster, RosterStore};

mod app;
mod departments;
mod groups;
mod instructors;
mod notifications;
mod students;
mod subjects;

pub use app::add_routes;
pub use notifications::{listen_balance_done, relay_balance_done, BalanceEvents};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub balance_max_attempts: i32,
    pub events: BalanceEvents,
}

/// Query parameters shared by the list endpoints. Id lists are comma separated: `?d=1,2`.
#[derive(Deserialize, Debug, Default)]
pub struct RosterFilter {
    d: Option<String>,
    g: Option<String>,
    #[serde(rename = "fn")]
    first_name: Option<String>,
    #[serde(rename = "ln")]
    last_name: Option<String>,
}

impl RosterFilter {
    pub fn departments(&self) -> RosterResult<Vec<i64>> {
        parse_ids("d", self.d.as_deref())
    }

    pub fn groups(&self) -> RosterResult<Vec<i64>> {
        parse_ids("g", self.g.as_deref())
    }

    pub fn first_name(&self) -> Option<&str> {
        non_blank(self.first_name.as_deref())
    }

    pub fn last_name(&self) -> Option<&str> {
        non_blank(self.last_name.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn parse_ids(name: &str, raw: Option<&str>) -> RosterResult<Vec<i64>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| {
            id.parse::<i64>().map_err(|_| {
                RosterError::Validation(format!("{name} must be a comma separated list of ids"))
            })
        })
        .collect()
}

/// A department as embedded in list items.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DepartmentRef {
    pub id: DepartmentId,
    pub name: String,
}

/// Tables whose rows belong to a department.
#[derive(Debug, Clone, Copy)]
pub enum Owned {
    Instructor,
    Student,
}

impl Owned {
    fn entity(self) -> &'static str {
        match self {
            Owned::Instructor => "instructor",
            Owned::Student => "student",
        }
    }

    fn department_query(self) -> &'static str {
        match self {
            Owned::Instructor => "SELECT department_id FROM instructors WHERE id = $1",
            Owned::Student => "SELECT department_id FROM students WHERE id = $1",
        }
    }
}

async fn department_of(
    conn: &mut PgConnection,
    owned: Owned,
    id: i64,
) -> RosterResult<DepartmentId> {
    let department_id: Option<DepartmentId> = sqlx::query_scalar(owned.department_query())
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    department_id.ok_or(RosterError::NotFound(owned.entity(), id))
}

/// Lock departments in ascending id order, so that two transactions locking the same pair
/// cannot deadlock.
pub async fn lock_departments(
    conn: &mut PgConnection,
    department_ids: &[DepartmentId],
) -> RosterResult<()> {
    let mut department_ids = department_ids.to_vec();
    department_ids.sort_unstable();
    department_ids.dedup();

    let mut roster = PgRoster::new(conn);
    for department_id in department_ids {
        roster.lock_department(department_id).await?;
    }

    Ok(())
}

/// Lock the department a row currently belongs to, together with `target` if given, and return
/// the owning department. The owner is read again once the locks are held: a row only moves
/// between departments under its department's lock.
pub async fn lock_owner(
    conn: &mut PgConnection,
    owned: Owned,
    id: i64,
    target: Option<DepartmentId>,
) -> RosterResult<DepartmentId> {
    let department_id = department_of(conn, owned, id).await?;

    let mut departments = vec![department_id];
    departments.extend(target);
    lock_departments(conn, &departments).await?;

    let locked = department_of(conn, owned, id).await?;
    if locked != department_id {
        return Err(RosterError::Conflict(format!(
            "{} {id} moved to another department concurrently, try again",
            owned.entity()
        )));
    }

    Ok(department_id)
}

/// Enqueue a balancing run for each department, in the caller's transaction.
pub async fn enqueue_balance(
    conn: &mut PgConnection,
    state: &AppState,
    department_ids: &[DepartmentId],
) -> RosterResult<()> {
    let mut department_ids = department_ids.to_vec();
    department_ids.sort_unstable();
    department_ids.dedup();

    for department_id in department_ids {
        let job = NewBalanceJob::new(department_id, state.balance_max_attempts);
        let job_id = BalanceQueue::enqueue(&mut *conn, job).await?;

        debug!(job_id, department_id, "enqueued balance job");
        metrics::counter!("balance_jobs_enqueued").increment(1);
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ids() {
        assert_eq!(parse_ids("d", None).unwrap(), Vec::<i64>::new());
        assert_eq!(parse_ids("d", Some("")).unwrap(), Vec::<i64>::new());
        assert_eq!(parse_ids("d", Some("1,2, 3")).unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            parse_ids("g", Some("1,two")),
            Err(RosterError::Validation(_))
        ));
    }

    #[test]
    fn test_blank_name_filters_are_ignored() {
        let filter = RosterFilter {
            first_name: Some("  ".to_owned()),
            last_name: Some(" Lovelace ".to_owned()),
            ..Default::default()
        };

        assert_eq!(filter.first_name(), None);
        assert_eq!(filter.last_name(), Some("Lovelace"));
    }
}
