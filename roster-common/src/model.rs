//! # Model
//!
//! Roster entities as stored in PostgreSQL, and the validation rules applied to incoming values
//! before any mutation is attempted.
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{RosterError, RosterResult};

pub type DepartmentId = i64;
pub type GroupId = i64;
pub type InstructorId = i64;
pub type StudentId = i64;
pub type SubjectId = i64;

/// Lowest and highest accepted mark.
pub const MIN_MARK: i32 = 1;
pub const MAX_MARK: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Department {
    pub id: DepartmentId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subject {
    pub id: SubjectId,
    pub name: String,
    pub department_id: DepartmentId,
}

/// An instructor without the photo payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instructor {
    pub id: InstructorId,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub employ_date: NaiveDate,
    pub department_id: DepartmentId,
    pub has_photo: bool,
}

/// A student without the photo payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Student {
    pub id: StudentId,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub enroll_date: NaiveDate,
    pub department_id: DepartmentId,
    pub group_id: Option<GroupId>,
    pub has_photo: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Group {
    pub id: GroupId,
    pub department_id: DepartmentId,
    pub instructor_id: Option<InstructorId>,
}

/// A student's mark record for one subject. `mark` stays unset until graded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StudentMark {
    pub subject_id: SubjectId,
    pub subject_name: String,
    pub mark: Option<i32>,
}

/// A stored photo and its mime type.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Photo {
    pub photo: Vec<u8>,
    pub photo_mime: Option<String>,
}

impl Photo {
    pub const DEFAULT_MIME: &'static str = "image/jpeg";

    pub fn mime(&self) -> &str {
        self.photo_mime.as_deref().unwrap_or(Self::DEFAULT_MIME)
    }
}

/// Trim a name field and reject it if nothing is left.
pub fn validate_name(field: &str, value: &str) -> RosterResult<String> {
    let trimmed = value.trim();

    if trimmed.is_empty() {
        return Err(RosterError::Validation(format!("{field} must not be empty")));
    }

    Ok(trimmed.to_owned())
}

/// Birth dates must fall between 1900-01-01 and `today`, both included.
pub fn validate_birth_date(birth_date: NaiveDate, today: NaiveDate) -> RosterResult<NaiveDate> {
    let earliest = NaiveDate::from_ymd_opt(1900, 1, 1).expect("1900-01-01 is a valid date");

    if birth_date < earliest || birth_date > today {
        return Err(RosterError::Validation(format!(
            "birth_date {birth_date} must be between {earliest} and {today}"
        )));
    }

    Ok(birth_date)
}

/// A mark is either unset or an integer in `MIN_MARK..=MAX_MARK`.
pub fn validate_mark(mark: Option<i32>) -> RosterResult<Option<i32>> {
    match mark {
        Some(value) if !(MIN_MARK..=MAX_MARK).contains(&value) => Err(RosterError::Validation(
            format!("mark {value} must be between {MIN_MARK} and {MAX_MARK}"),
        )),
        _ => Ok(mark),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    #[test]
    fn test_validate_name_trims() {
        assert_eq!(validate_name("first_name", "  Ada ").unwrap(), "Ada");
    }

    #[test]
    fn test_validate_name_rejects_blank() {
        assert!(matches!(
            validate_name("last_name", "   "),
            Err(RosterError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_birth_date_range() {
        let today = date(2024, 9, 1);

        assert!(validate_birth_date(date(2001, 5, 17), today).is_ok());
        assert!(validate_birth_date(date(1900, 1, 1), today).is_ok());
        assert!(validate_birth_date(today, today).is_ok());
        assert!(validate_birth_date(date(1899, 12, 31), today).is_err());
        assert!(validate_birth_date(date(2024, 9, 2), today).is_err());
    }

    #[test]
    fn test_validate_mark_bounds() {
        assert_eq!(validate_mark(None).unwrap(), None);
        assert_eq!(validate_mark(Some(1)).unwrap(), Some(1));
        assert_eq!(validate_mark(Some(5)).unwrap(), Some(5));
        assert!(validate_mark(Some(0)).is_err());
        assert!(validate_mark(Some(6)).is_err());
        assert!(validate_mark(Some(-3)).is_err());
    }

    #[test]
    fn test_photo_mime_defaults_to_jpeg() {
        let photo = Photo {
            photo: vec![1, 2, 3],
            photo_mime: None,
        };
        assert_eq!(photo.mime(), "image/jpeg");

        let photo = Photo {
            photo: vec![1, 2, 3],
            photo_mime: Some("image/png".to_owned()),
        };
        assert_eq!(photo.mime(), "image/png");
    }
}
