//! # Eligibility
//!
//! Guards evaluated by the handlers inside the same transaction as the mutation they protect.
//! The department lock must already be held so the answer cannot change before commit.
use crate::error::{RosterError, RosterResult};
use crate::model::DepartmentId;
use crate::store::RosterStore;

/// A department can take students only while it employs at least one instructor.
pub async fn department_has_instructor<S>(
    store: &mut S,
    department_id: DepartmentId,
) -> RosterResult<bool>
where
    S: RosterStore + ?Sized,
{
    Ok(store.instructor_count(department_id).await? >= 1)
}

/// True iff the department has exactly one instructor and at least one student.
pub async fn is_last_instructor<S>(store: &mut S, department_id: DepartmentId) -> RosterResult<bool>
where
    S: RosterStore + ?Sized,
{
    if store.instructor_count(department_id).await? != 1 {
        return Ok(false);
    }

    Ok(store.student_count(department_id).await? >= 1)
}

pub async fn ensure_department_has_instructor<S>(
    store: &mut S,
    department_id: DepartmentId,
) -> RosterResult<()>
where
    S: RosterStore + ?Sized,
{
    if !department_has_instructor(store, department_id).await? {
        return Err(RosterError::Conflict(format!(
            "department {department_id} has no instructors to teach its students"
        )));
    }

    Ok(())
}

/// Rejects removing or transferring away the only instructor of a department that has students.
pub async fn ensure_not_last_instructor<S>(
    store: &mut S,
    department_id: DepartmentId,
) -> RosterResult<()>
where
    S: RosterStore + ?Sized,
{
    if is_last_instructor(store, department_id).await? {
        return Err(RosterError::Conflict(format!(
            "cannot remove the last instructor of department {department_id} while it has students"
        )));
    }

    Ok(())
}
