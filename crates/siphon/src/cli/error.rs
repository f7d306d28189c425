//! User-facing errors with suggestions.

use siphon_ids::JobId;
use std::fmt;

/// An error with context and `TRY:` suggestions.
#[derive(Debug)]
pub struct HelpfulError {
    pub message: String,
    pub context: Option<String>,
    pub suggestions: Vec<String>,
}

impl HelpfulError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_suggestions(mut self, suggestions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.suggestions.extend(suggestions.into_iter().map(Into::into));
        self
    }

    pub fn no_manifest() -> Self {
        Self::new("No content source configured")
            .with_context("Building work items needs a manifest to read content, roles and links from")
            .with_suggestions([
                "TRY: Pass one: siphon --manifest export.json drain",
                "TRY: Set manifest_path in ~/.siphon/config.toml",
                "TRY: Export SIPHON_MANIFEST=/path/to/export.json",
            ])
    }

    pub fn job_not_found(job_id: JobId) -> Self {
        Self::new(format!("Job not found: {}", job_id))
            .with_context("The job table has no row with this id")
            .with_suggestions([
                "TRY: List leased jobs: siphon jobs --state running".to_string(),
                format!("TRY: Check the database in use: siphon status (job {})", job_id),
            ])
    }
}

impl fmt::Display for HelpfulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR: {}", self.message)?;
        if let Some(context) = &self.context {
            write!(f, "\n\n{}", context)?;
        }
        if !self.suggestions.is_empty() {
            writeln!(f)?;
            for suggestion in &self.suggestions {
                write!(f, "\n  {}", suggestion)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for HelpfulError {}
