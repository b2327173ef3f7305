use thiserror::Error;

/// Errors produced by the chunk pipeline and the hoard cache.
///
/// Callers branch on the variant: `Busy` is retried internally with
/// backoff and never crosses the request boundary, `Corruption` on the
/// hoard path is safe-invalidated and reported as not-found, and
/// `Shutdown`/`UserGone` are terminal for the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NexusError {
    #[error("invalid argument: {0}")]
    BadInput(String),

    #[error("chunk {0} not found in keyring")]
    NotFound(u64),

    #[error("backing store I/O error: {0}")]
    IoError(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("device is shutting down")]
    Shutdown,

    #[error("keying daemon has gone away")]
    UserGone,

    #[error("resource busy")]
    Busy,
}

impl NexusError {
    /// Rank used when aggregating fragment errors into a single request
    /// completion: the highest-ranked error wins.
    pub fn severity(&self) -> u32 {
        match self {
            NexusError::Busy => 1,
            NexusError::BadInput(_) => 2,
            NexusError::ResourceExhausted(_) => 3,
            NexusError::NotFound(_) => 4,
            NexusError::IoError(_) => 5,
            NexusError::Corruption(_) => 6,
            NexusError::UserGone => 7,
            NexusError::Shutdown => 8,
        }
    }

    /// Merge two optional outcomes, keeping the more severe failure.
    pub fn merge(current: Option<NexusError>, new: Option<NexusError>) -> Option<NexusError> {
        match (current, new) {
            (None, n) => n,
            (c, None) => c,
            (Some(c), Some(n)) => {
                if n.severity() > c.severity() {
                    Some(n)
                } else {
                    Some(c)
                }
            }
        }
    }
}

impl From<std::io::Error> for NexusError {
    fn from(err: std::io::Error) -> Self {
        NexusError::IoError(err.to_string())
    }
}

impl From<nix::Error> for NexusError {
    fn from(err: nix::Error) -> Self {
        NexusError::IoError(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn merge_keeps_most_severe() {
        let io = Some(NexusError::IoError("short read".into()));
        let corrupt = Some(NexusError::Corruption("tag mismatch".into()));
        assert_eq!(NexusError::merge(io.clone(), corrupt.clone()), corrupt);
        assert_eq!(NexusError::merge(corrupt.clone(), io), corrupt);
        assert_eq!(NexusError::merge(None, None), None);
    }
}
