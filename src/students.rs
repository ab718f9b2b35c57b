use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::Query;
use axum::Extension;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::{StudentName, Teacher, STUDENTS, TEACHER_REFS};
use crate::store::{DocRef, FieldError, RecordStore, RefEntry, StoreError};
use crate::{proceeds, AppState, Error, Payload};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{0}")]
    Invalid(&'static str),

    #[error("student not found")]
    StudentNotFound,

    #[error("missing teacherIDs field")]
    MissingReferences,

    #[error("teacherIDs field is not an array of references")]
    InvalidReferences,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<FieldError> for ResolveError {
    fn from(err: FieldError) -> Self {
        match err {
            FieldError::Missing(_) => ResolveError::MissingReferences,
            FieldError::WrongType { .. } => ResolveError::InvalidReferences,
        }
    }
}

/// Expands a student's teacher references into teacher records.
pub struct TeacherResolver {
    store: Arc<dyn RecordStore>,
}

impl TeacherResolver {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Looks up the first student named `first_name last_name` and returns the
    /// teachers it references, in reference order.
    ///
    /// Schema defects on the student fail the call. Individual references that
    /// are malformed, dangling, or point at something that is not a teacher are
    /// skipped, so the result may be shorter than the reference list or empty.
    pub async fn resolve_teachers(
        &self,
        first_name: &str,
        last_name: &str,
    ) -> Result<Vec<Teacher>, ResolveError> {
        if first_name.is_empty() || last_name.is_empty() {
            return Err(ResolveError::Invalid(
                "firstName and lastName query parameters required",
            ));
        }

        let filters = [
            ("firstName", Value::from(first_name)),
            ("lastName", Value::from(last_name)),
        ];
        let student = self
            .store
            .query_eq(STUDENTS, &filters, 1)
            .await?
            .into_iter()
            .next()
            .ok_or(ResolveError::StudentNotFound)?;

        let refs: Vec<DocRef> = student
            .references(TEACHER_REFS)?
            .into_iter()
            .enumerate()
            .filter_map(|(slot, entry)| match entry {
                RefEntry::Valid(reference) => Some(reference),
                RefEntry::Malformed => {
                    log::warn!(
                        "Skipping malformed teacher reference #{} on student {}",
                        slot,
                        student.reference
                    );
                    None
                }
            })
            .collect();

        let mut teachers = Vec::with_capacity(refs.len());
        for reference in refs {
            let doc = match self.store.resolve(&reference).await {
                Ok(doc) => doc,
                Err(err) => {
                    log::warn!("Skipping teacher {}: {}", reference, err);
                    continue;
                }
            };
            match doc.decode::<Teacher>() {
                Ok(teacher) => teachers.push(teacher),
                Err(err) => log::warn!("Skipping undecodable teacher {}: {}", reference, err),
            }
        }
        Ok(teachers)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TeacherList {
    pub teachers: Vec<Teacher>,
}

pub async fn list_teachers(
    Extension(state): Extension<AppState>,
    query: Result<Query<StudentName>, QueryRejection>,
) -> Payload<TeacherList> {
    let Query(name) = query.map_err(|rejection| Error::invalid(rejection.to_string()))?;
    let teachers = state
        .deadline(state.resolver.resolve_teachers(&name.first_name, &name.last_name))
        .await??;
    proceeds(TeacherList { teachers })
}
