use thiserror::Error;

/// Why an upload candidate was turned away before reaching the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    NotCalendar,
    TooLarge,
    Empty,
}

impl RejectionReason {
    pub fn message(self) -> &'static str {
        match self {
            RejectionReason::NotCalendar => "Only .ics files are allowed",
            RejectionReason::TooLarge => {
                "Your file size exceeds our 5 MB limit. Please try uploading a different file."
            }
            RejectionReason::Empty => "No file(s) provided",
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("'{name}' rejected: {}", reason.message())]
    InvalidFileType {
        name: String,
        reason: RejectionReason,
    },

    #[error("failed to upload the file, please try again ({0})")]
    UploadTransport(String),

    #[error("upload failed with status {status}: {body}")]
    UploadRejected { status: u16, body: String },

    #[error("stored value under '{key}' is not valid workspace JSON")]
    MalformedStoredJson {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("parse result does not contain a data.events array")]
    MissingEventData,

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("node '{0}' not found")]
    UnknownNode(String),

    #[error("edge '{0}' not found")]
    UnknownEdge(String),

    #[error("node '{0}' already exists")]
    DuplicateNode(String),

    #[error("edge '{0}' is declared more than once")]
    DuplicateEdge(String),

    #[error("node label cannot be empty")]
    EmptyLabel,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl WorkspaceError {
    /// True for errors caused by the caller's input rather than the environment.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            WorkspaceError::InvalidFileType { .. }
                | WorkspaceError::UnknownNode(_)
                | WorkspaceError::UnknownEdge(_)
                | WorkspaceError::DuplicateNode(_)
                | WorkspaceError::DuplicateEdge(_)
                | WorkspaceError::EmptyLabel
                | WorkspaceError::MissingEventData
                | WorkspaceError::InvalidJson(_)
        )
    }
}

pub type Result<T, E = WorkspaceError> = std::result::Result<T, E>;
