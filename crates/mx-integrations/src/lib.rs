//! Boundary adapters: git context capture, GitHub issue sync, LLM
//! pass-through, and the voice bridge.
//!
//! The fabric core never depends on these; they drive it through its public
//! store/engine operations.

pub mod git_context;
pub mod github;
pub mod llm;
pub mod voice;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error("github token not configured")]
    MissingToken,
    #[error("github: {0}")]
    GitHub(#[from] octocrab::Error),
    #[error("git: {0}")]
    Git(#[from] git2::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store: {0}")]
    Store(#[from] mx_store::StoreError),
    #[error("adapter disabled: {0}")]
    Disabled(&'static str),
}
