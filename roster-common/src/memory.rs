//! An in-process `RosterStore` with the same semantics as `PgRoster`, for tests that exercise the
//! balancing rules without a database.
use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::error::{RosterError, RosterResult};
use crate::model::{DepartmentId, GroupId, InstructorId, StudentId};
use crate::store::RosterStore;

#[derive(Debug, Default)]
pub struct MemoryRoster {
    next_id: i64,
    departments: BTreeSet<DepartmentId>,
    instructors: BTreeMap<InstructorId, DepartmentId>,
    students: BTreeMap<StudentId, (DepartmentId, Option<GroupId>)>,
    groups: BTreeMap<GroupId, (DepartmentId, Option<InstructorId>)>,
    /// Departments locked so far, in locking order.
    pub locks: Vec<DepartmentId>,
    /// Number of group created or deleted calls.
    pub structural_writes: usize,
    /// Number of student or instructor assignment calls.
    pub assignment_writes: usize,
}

impl MemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn add_department(&mut self) -> DepartmentId {
        let id = self.next_id();
        self.departments.insert(id);
        id
    }

    pub fn add_instructor(&mut self, department_id: DepartmentId) -> InstructorId {
        let id = self.next_id();
        self.instructors.insert(id, department_id);
        id
    }

    pub fn add_instructors(&mut self, department_id: DepartmentId, n: usize) -> Vec<InstructorId> {
        (0..n).map(|_| self.add_instructor(department_id)).collect()
    }

    pub fn add_student(&mut self, department_id: DepartmentId) -> StudentId {
        let id = self.next_id();
        self.students.insert(id, (department_id, None));
        id
    }

    pub fn add_students(&mut self, department_id: DepartmentId, n: usize) -> Vec<StudentId> {
        (0..n).map(|_| self.add_student(department_id)).collect()
    }

    /// Remove an instructor, leaving the groups they headed without one.
    pub fn remove_instructor(&mut self, instructor_id: InstructorId) {
        self.instructors.remove(&instructor_id);
        for (_, instructor) in self.groups.values_mut() {
            if *instructor == Some(instructor_id) {
                *instructor = None;
            }
        }
    }

    pub fn remove_student(&mut self, student_id: StudentId) {
        self.students.remove(&student_id);
    }

    pub fn group_of(&self, student_id: StudentId) -> Option<GroupId> {
        self.students.get(&student_id).and_then(|(_, group)| *group)
    }

    pub fn instructor_of(&self, group_id: GroupId) -> Option<InstructorId> {
        self.groups.get(&group_id).and_then(|(_, instructor)| *instructor)
    }

    pub fn department_of_group(&self, group_id: GroupId) -> Option<DepartmentId> {
        self.groups.get(&group_id).map(|(department, _)| *department)
    }

    pub fn department_of_instructor(&self, instructor_id: InstructorId) -> Option<DepartmentId> {
        self.instructors.get(&instructor_id).copied()
    }

    fn ensure_department(&self, department_id: DepartmentId) -> RosterResult<()> {
        if self.departments.contains(&department_id) {
            Ok(())
        } else {
            Err(RosterError::NotFound("department", department_id))
        }
    }
}

#[async_trait]
impl RosterStore for MemoryRoster {
    async fn lock_department(&mut self, department_id: DepartmentId) -> RosterResult<()> {
        self.ensure_department(department_id)?;
        self.locks.push(department_id);
        Ok(())
    }

    async fn instructor_count(&mut self, department_id: DepartmentId) -> RosterResult<usize> {
        Ok(self
            .instructors
            .values()
            .filter(|department| **department == department_id)
            .count())
    }

    async fn student_count(&mut self, department_id: DepartmentId) -> RosterResult<usize> {
        Ok(self
            .students
            .values()
            .filter(|(department, _)| *department == department_id)
            .count())
    }

    async fn list_instructors(
        &mut self,
        department_id: DepartmentId,
    ) -> RosterResult<Vec<InstructorId>> {
        Ok(self
            .instructors
            .iter()
            .filter(|(_, department)| **department == department_id)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn group_assignments(
        &mut self,
        department_id: DepartmentId,
    ) -> RosterResult<Vec<(GroupId, Option<InstructorId>)>> {
        Ok(self
            .groups
            .iter()
            .filter(|(_, (department, _))| *department == department_id)
            .map(|(id, (_, instructor))| (*id, *instructor))
            .collect())
    }

    async fn student_assignments(
        &mut self,
        department_id: DepartmentId,
    ) -> RosterResult<Vec<(StudentId, Option<GroupId>)>> {
        Ok(self
            .students
            .iter()
            .filter(|(_, (department, _))| *department == department_id)
            .map(|(id, (_, group))| (*id, *group))
            .collect())
    }

    async fn create_group(&mut self, department_id: DepartmentId) -> RosterResult<GroupId> {
        self.ensure_department(department_id)?;
        let id = self.next_id();
        self.groups.insert(id, (department_id, None));
        self.structural_writes += 1;
        Ok(id)
    }

    async fn delete_group(&mut self, group_id: GroupId) -> RosterResult<()> {
        if self.groups.remove(&group_id).is_none() {
            return Err(RosterError::NotFound("group", group_id));
        }

        for (_, group) in self.students.values_mut() {
            if *group == Some(group_id) {
                *group = None;
            }
        }
        self.structural_writes += 1;
        Ok(())
    }

    async fn set_student_group(
        &mut self,
        student_id: StudentId,
        group_id: GroupId,
    ) -> RosterResult<()> {
        let group_department = self.department_of_group(group_id);

        match self.students.get_mut(&student_id) {
            Some((department, group)) if Some(*department) == group_department => {
                *group = Some(group_id);
                self.assignment_writes += 1;
                Ok(())
            }
            _ => Err(RosterError::InvariantBreach(format!(
                "student {student_id} cannot join group {group_id} of another department"
            ))),
        }
    }

    async fn set_group_instructor(
        &mut self,
        group_id: GroupId,
        instructor_id: InstructorId,
    ) -> RosterResult<()> {
        let instructor_department = self.department_of_instructor(instructor_id);

        match self.groups.get_mut(&group_id) {
            Some((department, instructor)) if Some(*department) == instructor_department => {
                *instructor = Some(instructor_id);
                self.assignment_writes += 1;
                Ok(())
            }
            _ => Err(RosterError::InvariantBreach(format!(
                "group {group_id} cannot be headed by instructor {instructor_id} of another department"
            ))),
        }
    }

    async fn group_members(&mut self, group_id: GroupId) -> RosterResult<Vec<StudentId>> {
        Ok(self
            .students
            .iter()
            .filter(|(_, (_, group))| *group == Some(group_id))
            .map(|(id, _)| *id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_group_unassigns_students() {
        let mut roster = MemoryRoster::new();
        let department = roster.add_department();
        let student = roster.add_student(department);
        let group = roster.create_group(department).await.unwrap();

        roster.set_student_group(student, group).await.unwrap();
        assert_eq!(roster.group_of(student), Some(group));

        roster.delete_group(group).await.unwrap();
        assert_eq!(roster.group_of(student), None);
        assert!(matches!(
            roster.delete_group(group).await,
            Err(RosterError::NotFound("group", _))
        ));
    }

    #[tokio::test]
    async fn test_cross_department_assignment_is_rejected() {
        let mut roster = MemoryRoster::new();
        let physics = roster.add_department();
        let history = roster.add_department();
        let student = roster.add_student(physics);
        let historian = roster.add_instructor(history);
        let physics_group = roster.create_group(physics).await.unwrap();
        let history_group = roster.create_group(history).await.unwrap();

        assert!(matches!(
            roster.set_student_group(student, history_group).await,
            Err(RosterError::InvariantBreach(_))
        ));
        assert!(matches!(
            roster.set_group_instructor(physics_group, historian).await,
            Err(RosterError::InvariantBreach(_))
        ));
        assert_eq!(roster.assignment_writes, 0);
    }

    #[tokio::test]
    async fn test_lock_unknown_department() {
        let mut roster = MemoryRoster::new();

        assert!(matches!(
            roster.lock_department(7).await,
            Err(RosterError::NotFound("department", 7))
        ));
        assert!(roster.locks.is_empty());
    }
}
