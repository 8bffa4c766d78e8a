/// Error type shared by every CTF reader in this crate
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic, truncated record, impossible count or size
    #[error("format error: {0}")]
    Format(String),

    /// CPersist type code this decoder does not know
    #[error("unknown CPersist tag type {0}")]
    UnknownTagType(i32),

    #[error("{what} {value} out of range (limit {limit})")]
    OutOfRange {
        what: &'static str,
        value: usize,
        limit: usize,
    },

    #[error("singular fiducial geometry (det = {det})")]
    DegenerateGeometry { det: f64 },

    #[error("unable to compute rotation (smallest singular value {singular_value})")]
    UnresolvableRotation { singular_value: f64 },

    #[error("{sensor} references unknown channel {reference}")]
    UnresolvedReference { sensor: String, reference: String },

    #[error("sample data is mapped read-only")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// Turn a short read into a format error, keep everything else as I/O
    pub(crate) fn truncated(context: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Format(format!("truncated {}", context))
        } else {
            Error::Io(err)
        }
    }
}

/// Attach a record name to a failed read
pub(crate) trait ReadContext<T> {
    fn context(self, what: &str) -> Result<T>;
}

impl<T> ReadContext<T> for std::io::Result<T> {
    fn context(self, what: &str) -> Result<T> {
        self.map_err(|e| Error::truncated(what, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, ErrorKind, Read};

    #[test]
    fn test_short_read_becomes_format_error() {
        let mut buf = [0u8; 8];
        let err = Cursor::new(vec![1u8, 2, 3])
            .read_exact(&mut buf)
            .context("sensor record")
            .unwrap_err();
        match err {
            Error::Format(msg) => assert_eq!(msg, "truncated sensor record"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_other_io_errors_pass_through() {
        let io: std::io::Result<()> = Err(std::io::Error::new(ErrorKind::PermissionDenied, "no"));
        assert!(matches!(io.context("header"), Err(Error::Io(_))));
    }

    #[test]
    fn test_out_of_range_message() {
        let err = Error::OutOfRange {
            what: "trial",
            value: 4,
            limit: 3,
        };
        assert_eq!(err.to_string(), "trial 4 out of range (limit 3)");
    }
}
