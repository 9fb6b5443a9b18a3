use thiserror::Error;

/// Failures that can happen while driving a guild's playback.
///
/// None of these ever escape a playback cycle: the session logs them and
/// advances the queue. They are surfaced as values so collaborators
/// (resolvers, stores, list APIs) can say *why* something failed.
#[derive(Debug, Error)]
pub enum JukeboxError {
    /// The item could not be turned into a playable resource. Skipped, never retried.
    #[error("no se pudo resolver '{item_id}': {reason}")]
    Resolution { item_id: String, reason: String },

    /// Playback started but the stream failed midway. Skipped, never retried.
    #[error("error de stream: {0}")]
    Stream(String),

    /// A paginated list request failed. Callers keep the partial result.
    #[error("error de transporte: {0}")]
    Transport(String),

    /// Volume out of range, malformed playlist/video identifier, etc.
    #[error("entrada inválida: {0}")]
    InvalidInput(String),

    #[error("error de almacenamiento: {0}")]
    Store(#[from] anyhow::Error),

    #[error("error de conexión de voz: {0}")]
    Connection(String),
}

impl JukeboxError {
    pub fn resolution(item_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Resolution {
            item_id: item_id.into(),
            reason: reason.to_string(),
        }
    }
}

pub type JukeboxResult<T> = std::result::Result<T, JukeboxError>;
