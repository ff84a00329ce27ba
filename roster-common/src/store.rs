//! # Roster store
//!
//! The operations the balancer and the eligibility rules need from the roster, and their
//! PostgreSQL implementation. Every call runs inside a transaction owned by the caller.
use async_trait::async_trait;
use sqlx::postgres::PgConnection;

use crate::error::{RosterError, RosterResult};
use crate::model::{DepartmentId, GroupId, InstructorId, StudentId};

#[async_trait]
pub trait RosterStore: Send {
    /// Hold the per-department lock until the surrounding transaction ends.
    /// Balancing runs and structural mutations of the same department are serialized on it.
    async fn lock_department(&mut self, department_id: DepartmentId) -> RosterResult<()>;

    async fn instructor_count(&mut self, department_id: DepartmentId) -> RosterResult<usize>;

    async fn student_count(&mut self, department_id: DepartmentId) -> RosterResult<usize>;

    /// Instructor ids of a department, in insertion order.
    async fn list_instructors(
        &mut self,
        department_id: DepartmentId,
    ) -> RosterResult<Vec<InstructorId>>;

    /// Group ids of a department in insertion order, with each group's current instructor.
    async fn group_assignments(
        &mut self,
        department_id: DepartmentId,
    ) -> RosterResult<Vec<(GroupId, Option<InstructorId>)>>;

    /// Student ids of a department in insertion order, with each student's current group.
    async fn student_assignments(
        &mut self,
        department_id: DepartmentId,
    ) -> RosterResult<Vec<(StudentId, Option<GroupId>)>>;

    /// Create an empty group without an instructor.
    async fn create_group(&mut self, department_id: DepartmentId) -> RosterResult<GroupId>;

    /// Delete a group. Its students are left without a group.
    async fn delete_group(&mut self, group_id: GroupId) -> RosterResult<()>;

    /// Fails with `InvariantBreach` if the student and the group belong to different departments.
    async fn set_student_group(
        &mut self,
        student_id: StudentId,
        group_id: GroupId,
    ) -> RosterResult<()>;

    /// Fails with `InvariantBreach` if the group and the instructor belong to different departments.
    async fn set_group_instructor(
        &mut self,
        group_id: GroupId,
        instructor_id: InstructorId,
    ) -> RosterResult<()>;

    /// Student ids of a group, in insertion order.
    async fn group_members(&mut self, group_id: GroupId) -> RosterResult<Vec<StudentId>>;

    async fn list_groups(&mut self, department_id: DepartmentId) -> RosterResult<Vec<GroupId>> {
        Ok(self
            .group_assignments(department_id)
            .await?
            .into_iter()
            .map(|(group_id, _)| group_id)
            .collect())
    }

    async fn list_students(
        &mut self,
        department_id: DepartmentId,
    ) -> RosterResult<Vec<StudentId>> {
        Ok(self
            .student_assignments(department_id)
            .await?
            .into_iter()
            .map(|(student_id, _)| student_id)
            .collect())
    }
}

/// A `RosterStore` over a connection borrowed from an open transaction (or savepoint).
pub struct PgRoster<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> PgRoster<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl RosterStore for PgRoster<'_> {
    async fn lock_department(&mut self, department_id: DepartmentId) -> RosterResult<()> {
        let locked: Option<i64> =
            sqlx::query_scalar("SELECT id FROM departments WHERE id = $1 FOR UPDATE")
                .bind(department_id)
                .fetch_optional(&mut *self.conn)
                .await?;

        locked
            .map(|_| ())
            .ok_or(RosterError::NotFound("department", department_id))
    }

    async fn instructor_count(&mut self, department_id: DepartmentId) -> RosterResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instructors WHERE department_id = $1")
            .bind(department_id)
            .fetch_one(&mut *self.conn)
            .await?;

        Ok(count as usize)
    }

    async fn student_count(&mut self, department_id: DepartmentId) -> RosterResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM students WHERE department_id = $1")
            .bind(department_id)
            .fetch_one(&mut *self.conn)
            .await?;

        Ok(count as usize)
    }

    async fn list_instructors(
        &mut self,
        department_id: DepartmentId,
    ) -> RosterResult<Vec<InstructorId>> {
        let ids = sqlx::query_scalar("SELECT id FROM instructors WHERE department_id = $1 ORDER BY id")
            .bind(department_id)
            .fetch_all(&mut *self.conn)
            .await?;

        Ok(ids)
    }

    async fn group_assignments(
        &mut self,
        department_id: DepartmentId,
    ) -> RosterResult<Vec<(GroupId, Option<InstructorId>)>> {
        let rows = sqlx::query_as(
            "SELECT id, instructor_id FROM groups WHERE department_id = $1 ORDER BY id",
        )
        .bind(department_id)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(rows)
    }

    async fn student_assignments(
        &mut self,
        department_id: DepartmentId,
    ) -> RosterResult<Vec<(StudentId, Option<GroupId>)>> {
        let rows =
            sqlx::query_as("SELECT id, group_id FROM students WHERE department_id = $1 ORDER BY id")
                .bind(department_id)
                .fetch_all(&mut *self.conn)
                .await?;

        Ok(rows)
    }

    async fn create_group(&mut self, department_id: DepartmentId) -> RosterResult<GroupId> {
        let group_id = sqlx::query_scalar("INSERT INTO groups (department_id) VALUES ($1) RETURNING id")
            .bind(department_id)
            .fetch_one(&mut *self.conn)
            .await?;

        Ok(group_id)
    }

    async fn delete_group(&mut self, group_id: GroupId) -> RosterResult<()> {
        let result = sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(group_id)
            .execute(&mut *self.conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RosterError::NotFound("group", group_id));
        }

        Ok(())
    }

    async fn set_student_group(
        &mut self,
        student_id: StudentId,
        group_id: GroupId,
    ) -> RosterResult<()> {
        let base_query = r#"
UPDATE
    students
SET
    group_id = groups.id
FROM
    groups
WHERE
    students.id = $1
    AND groups.id = $2
    AND groups.department_id = students.department_id
        "#;

        let result = sqlx::query(base_query)
            .bind(student_id)
            .bind(group_id)
            .execute(&mut *self.conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RosterError::InvariantBreach(format!(
                "student {student_id} cannot join group {group_id} of another department"
            )));
        }

        Ok(())
    }

    async fn set_group_instructor(
        &mut self,
        group_id: GroupId,
        instructor_id: InstructorId,
    ) -> RosterResult<()> {
        let base_query = r#"
UPDATE
    groups
SET
    instructor_id = instructors.id
FROM
    instructors
WHERE
    groups.id = $1
    AND instructors.id = $2
    AND instructors.department_id = groups.department_id
        "#;

        let result = sqlx::query(base_query)
            .bind(group_id)
            .bind(instructor_id)
            .execute(&mut *self.conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RosterError::InvariantBreach(format!(
                "group {group_id} cannot be headed by instructor {instructor_id} of another department"
            )));
        }

        Ok(())
    }

    async fn group_members(&mut self, group_id: GroupId) -> RosterResult<Vec<StudentId>> {
        let ids = sqlx::query_scalar("SELECT id FROM students WHERE group_id = $1 ORDER BY id")
            .bind(group_id)
            .fetch_all(&mut *self.conn)
            .await?;

        Ok(ids)
    }
}
