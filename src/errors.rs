//! Typed error taxonomy for the portal orchestrator.
//!
//! One enum covers the coordinator surface; collaborators use `anyhow`
//! internally and are wrapped into the matching variant at the boundary.
//! Validation and not-found conditions are detected before any mutation,
//! so a caller seeing one of those can assume no side effect happened.

use thiserror::Error;

use crate::portal::PortalId;

/// Errors surfaced by the portal coordinator and its collaborators.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("Portal {id} not found")]
    NotFound { id: PortalId },

    #[error("Portal with slug '{slug}' not found")]
    SlugNotFound { slug: String },

    #[error("Portal slug cannot be blank")]
    BlankSlug,

    #[error("Portal slug '{slug}' is not in canonical form. Should be '{expected}'")]
    NonCanonicalSlug { slug: String, expected: String },

    #[error("Portal {existing_id} already exists with slug '{slug}'")]
    DuplicateSlug {
        slug: String,
        existing_id: PortalId,
    },

    #[error("No deployable candidate for pull request {pr_number}")]
    CandidateNotFound { pr_number: u64 },

    #[error("Deployment of portal {id} failed: {source}")]
    Deployment {
        id: PortalId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Process for portal {id} failed: {message}")]
    Process { id: PortalId, message: String },

    #[error("External collaborator error: {source}")]
    External {
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PortalError {
    /// True for errors caused by bad caller input (blank/non-canonical or
    /// duplicate slug) rather than by the system.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PortalError::BlankSlug
                | PortalError::NonCanonicalSlug { .. }
                | PortalError::DuplicateSlug { .. }
        )
    }

    /// True for lookups of ids or slugs that do not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PortalError::NotFound { .. }
                | PortalError::SlugNotFound { .. }
                | PortalError::CandidateNotFound { .. }
        )
    }
}

pub type Result<T, E = PortalError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_carries_id() {
        let err = PortalError::NotFound { id: 42 };
        assert!(err.to_string().contains("42"));
        assert!(err.is_not_found());
        assert!(!err.is_validation());
    }

    #[test]
    fn non_canonical_slug_names_expected_form() {
        let err = PortalError::NonCanonicalSlug {
            slug: "My Slug".to_string(),
            expected: "my-slug".to_string(),
        };
        assert!(err.to_string().contains("my-slug"));
        assert!(err.is_validation());
    }

    #[test]
    fn duplicate_slug_names_conflicting_portal() {
        let err = PortalError::DuplicateSlug {
            slug: "fix-login".to_string(),
            existing_id: 7,
        };
        assert!(err.to_string().contains('7'));
        assert!(err.is_validation());
    }

    #[test]
    fn deployment_error_preserves_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = PortalError::Deployment {
            id: 3,
            source: anyhow::Error::from(io_err),
        };
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn candidate_not_found_is_not_validation() {
        let err = PortalError::CandidateNotFound { pr_number: 42 };
        assert!(err.is_not_found());
        assert!(!err.is_validation());
    }
}
