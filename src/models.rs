use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ACCOUNTS: &str = "accounts";
pub const STUDENTS: &str = "students";
pub const TEACHERS: &str = "teachers";

/// Field on a student holding its teacher references.
pub const TEACHER_REFS: &str = "teacherIDs";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Teacher {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(rename = "studentIDs", default, skip_serializing)]
    pub student_ids: Option<Vec<Value>>,
}

impl Teacher {
    pub fn new<F: Into<String>, L: Into<String>>(first_name: F, last_name: L) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            student_ids: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentName {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}
