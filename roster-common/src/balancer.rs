//! # Balancer
//!
//! Sizes a department's group set from its instructor and student counts, then spreads students
//! and instructors over the groups in contiguous blocks.
//!
//! A run must happen inside a single transaction: the department lock is taken first, so a
//! concurrent run or structural mutation for the same department waits for the commit.
use std::num::NonZeroUsize;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::error::{RosterError, RosterResult};
use crate::model::{DepartmentId, GroupId};
use crate::store::RosterStore;

pub const DEFAULT_MAX_STUDENTS_PER_GROUP: usize = 10;

/// Group count and block sizes for a department with at least one student.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupQuotas {
    pub target_group_count: usize,
    pub students_per_group: usize,
    pub groups_per_instructor: usize,
}

impl GroupQuotas {
    /// `None` when there are no students: such a department needs no groups.
    pub fn compute(
        instructors: usize,
        students: usize,
        max_students_per_group: NonZeroUsize,
    ) -> RosterResult<Option<Self>> {
        if students == 0 {
            return Ok(None);
        }

        if instructors == 0 {
            return Err(RosterError::InvariantBreach(format!(
                "{students} students but no instructors to balance them over"
            )));
        }

        let groups_by_capacity = students.div_ceil(max_students_per_group.get());
        let groups_by_instructor = students.min(instructors);
        let target_group_count = groups_by_capacity.max(groups_by_instructor);

        Ok(Some(Self {
            target_group_count,
            students_per_group: students.div_ceil(target_group_count),
            groups_per_instructor: target_group_count.div_ceil(instructors),
        }))
    }
}

/// Walks `ids`, yielding each one `block` times before moving on. Stays on the last id once the
/// slice is exhausted.
pub struct BlockCursor<'a, T> {
    ids: &'a [T],
    block: usize,
    index: usize,
    taken: usize,
    overrun: bool,
}

impl<'a, T: Copy> BlockCursor<'a, T> {
    pub fn new(ids: &'a [T], block: usize) -> Self {
        Self {
            ids,
            block: block.max(1),
            index: 0,
            taken: 0,
            overrun: false,
        }
    }

    /// Whether the cursor had to clamp at the last id.
    pub fn overrun(&self) -> bool {
        self.overrun
    }
}

impl<T: Copy> Iterator for BlockCursor<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let last = self.ids.len().checked_sub(1)?;

        if self.taken == self.block {
            self.taken = 0;
            if self.index < last {
                self.index += 1;
            } else if !self.overrun {
                warn!(len = self.ids.len(), "block cursor clamped at the last id");
                self.overrun = true;
            }
        }

        self.taken += 1;
        Some(self.ids[self.index])
    }
}

/// What a single balancing run changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceReport {
    pub department_id: DepartmentId,
    pub groups_created: usize,
    pub groups_deleted: usize,
    pub group_count: usize,
    pub students_reassigned: usize,
    pub instructors_assigned: usize,
}

impl BalanceReport {
    fn new(department_id: DepartmentId) -> Self {
        Self {
            department_id,
            groups_created: 0,
            groups_deleted: 0,
            group_count: 0,
            students_reassigned: 0,
            instructors_assigned: 0,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.groups_created == 0
            && self.groups_deleted == 0
            && self.students_reassigned == 0
            && self.instructors_assigned == 0
    }
}

enum ResizeStep {
    Created(GroupId),
    Deleted(GroupId),
    Settled,
}

#[derive(Debug, Clone, Copy)]
pub struct Balancer {
    max_students_per_group: NonZeroUsize,
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new(
            NonZeroUsize::new(DEFAULT_MAX_STUDENTS_PER_GROUP)
                .expect("default group capacity is not zero"),
        )
    }
}

impl Balancer {
    pub fn new(max_students_per_group: NonZeroUsize) -> Self {
        Self {
            max_students_per_group,
        }
    }

    /// Rebalance one department. Running it again on an unchanged roster writes nothing.
    ///
    /// Each resize pass moves the group count by one step; the run repeats passes until the
    /// count settles on the target, so a single run always ends balanced.
    #[instrument(skip_all, fields(department_id = department_id))]
    pub async fn balance<S>(
        &self,
        store: &mut S,
        department_id: DepartmentId,
    ) -> RosterResult<BalanceReport>
    where
        S: RosterStore + ?Sized,
    {
        store.lock_department(department_id).await?;

        let instructors = store.instructor_count(department_id).await?;
        let students = store.student_count(department_id).await?;
        let mut report = BalanceReport::new(department_id);

        let Some(quotas) =
            GroupQuotas::compute(instructors, students, self.max_students_per_group)?
        else {
            report.group_count = store.list_groups(department_id).await?.len();
            debug!("no students, nothing to balance");
            return Ok(report);
        };

        let mut groups = store.list_groups(department_id).await?;
        loop {
            match Self::resize_once(store, department_id, &mut groups, quotas.target_group_count)
                .await?
            {
                ResizeStep::Created(group_id) => {
                    debug!(group_id, "created group");
                    report.groups_created += 1;
                }
                ResizeStep::Deleted(group_id) => {
                    debug!(group_id, "deleted group");
                    report.groups_deleted += 1;
                }
                ResizeStep::Settled => break,
            }
        }
        report.group_count = groups.len();

        report.students_reassigned = Self::assign_students(
            store,
            department_id,
            &groups,
            quotas.students_per_group,
        )
        .await?;
        report.instructors_assigned =
            Self::assign_instructors(store, department_id, quotas.groups_per_instructor).await?;

        debug!(?report, ?quotas, "balanced department");
        Ok(report)
    }

    /// One resize pass: grow or shrink the group set by exactly one group towards `target`.
    async fn resize_once<S>(
        store: &mut S,
        department_id: DepartmentId,
        groups: &mut Vec<GroupId>,
        target: usize,
    ) -> RosterResult<ResizeStep>
    where
        S: RosterStore + ?Sized,
    {
        if groups.len() < target {
            let group_id = store.create_group(department_id).await?;
            groups.push(group_id);
            return Ok(ResizeStep::Created(group_id));
        }

        if groups.len() > target {
            if let Some(group_id) = groups.pop() {
                store.delete_group(group_id).await?;
                return Ok(ResizeStep::Deleted(group_id));
            }
        }

        Ok(ResizeStep::Settled)
    }

    async fn assign_students<S>(
        store: &mut S,
        department_id: DepartmentId,
        groups: &[GroupId],
        students_per_group: usize,
    ) -> RosterResult<usize>
    where
        S: RosterStore + ?Sized,
    {
        let assignments = store.student_assignments(department_id).await?;
        let mut cursor = BlockCursor::new(groups, students_per_group);
        let mut written = 0;

        for (student_id, current) in assignments {
            let Some(group_id) = cursor.next() else {
                return Err(RosterError::InvariantBreach(format!(
                    "department {department_id} has students but no groups"
                )));
            };

            if current != Some(group_id) {
                store.set_student_group(student_id, group_id).await?;
                written += 1;
            }
        }

        Ok(written)
    }

    async fn assign_instructors<S>(
        store: &mut S,
        department_id: DepartmentId,
        groups_per_instructor: usize,
    ) -> RosterResult<usize>
    where
        S: RosterStore + ?Sized,
    {
        let instructors = store.list_instructors(department_id).await?;
        let groups = store.group_assignments(department_id).await?;
        let mut cursor = BlockCursor::new(&instructors, groups_per_instructor);
        let mut written = 0;

        for (group_id, current) in groups {
            let Some(instructor_id) = cursor.next() else {
                return Err(RosterError::InvariantBreach(format!(
                    "department {department_id} has groups but no instructors"
                )));
            };

            if current != Some(instructor_id) {
                store.set_group_instructor(group_id, instructor_id).await?;
                written += 1;
            }
        }

        Ok(written)
    }
}
