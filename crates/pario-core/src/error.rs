use std::io;

use thiserror::Error;

/// Success code shared by every entry point.
pub const PIO_NOERR: i32 = 0;

// Library-internal error band. Positive codes are OS errno values passed
// through unchanged; strongly negative codes below this band belong to the
// backends.
pub const PIO_EBADID: i32 = -500;
pub const PIO_EBADTYPE: i32 = -501;
pub const PIO_EBADIOTYPE: i32 = -502;
pub const PIO_EINVAL: i32 = -503;
pub const PIO_ENOMEM: i32 = -504;
pub const PIO_ENOTATT: i32 = -505;
pub const PIO_EIO: i32 = -506;
pub const PIO_EEXIST: i32 = -507;
pub const PIO_EMAXATTS: i32 = -508;
pub const PIO_ENOTVAR: i32 = -509;
pub const PIO_ENOTNC: i32 = -510;
pub const PIO_EPERM: i32 = -511;
pub const PIO_EINDEFINE: i32 = -512;
pub const PIO_ENOTINDEFINE: i32 = -513;
pub const PIO_EADIOSREAD: i32 = -520;
pub const PIO_EADIOS2ERR: i32 = -521;

/// Library error type covering the uniform error code space.
///
/// Positive codes are system errno values, zero is success (never
/// represented here), the -500 band is library-internal, and anything else
/// negative is a backend-reported code carried through unchanged.
#[derive(Debug, Error)]
pub enum PioError {
    /// OS-level error carrying the errno value.
    #[error("system error (errno={0})")]
    System(i32),

    /// Unknown iosystem, file, variable or decomposition id.
    #[error("bad id")]
    BadId,

    /// Unknown or unsupported primitive type.
    #[error("bad type")]
    BadType,

    /// Unknown or unconfigured iotype.
    #[error("bad iotype")]
    BadIoType,

    /// Invalid argument.
    #[error("invalid argument")]
    InvalidArgument,

    /// Out of memory.
    #[error("out of memory")]
    NoMemory,

    /// Attribute not found.
    #[error("attribute not found")]
    NotAtt,

    /// Variable not found.
    #[error("variable not found")]
    NotVar,

    /// Not a recognized container file.
    #[error("not a valid container file")]
    NotNc,

    /// Communication-layer failure.
    #[error("I/O or communication error")]
    Io,

    /// File already exists and clobber was not requested.
    #[error("file exists")]
    Exists,

    /// Too many attributes.
    #[error("too many attributes")]
    MaxAtts,

    /// Write attempted on a read-only file.
    #[error("permission denied")]
    Permission,

    /// Operation requires data mode but the file is in define mode.
    #[error("operation not allowed in define mode")]
    InDefine,

    /// Operation requires define mode.
    #[error("operation not allowed in data mode")]
    NotInDefine,

    /// Log-structured backend cannot service reads in this configuration.
    #[error("log-structured backend read error")]
    AdiosRead,

    /// Log-structured backend internal error.
    #[error("log-structured backend error")]
    AdiosErr,

    /// Backend-specific code carried through unchanged.
    #[error("backend error (code={0})")]
    Backend(i32),
}

pub type Result<T> = std::result::Result<T, PioError>;

impl PioError {
    /// Numeric code for this error in the uniform code space.
    pub fn code(&self) -> i32 {
        match self {
            PioError::System(e) => *e,
            PioError::BadId => PIO_EBADID,
            PioError::BadType => PIO_EBADTYPE,
            PioError::BadIoType => PIO_EBADIOTYPE,
            PioError::InvalidArgument => PIO_EINVAL,
            PioError::NoMemory => PIO_ENOMEM,
            PioError::NotAtt => PIO_ENOTATT,
            PioError::NotVar => PIO_ENOTVAR,
            PioError::NotNc => PIO_ENOTNC,
            PioError::Io => PIO_EIO,
            PioError::Exists => PIO_EEXIST,
            PioError::MaxAtts => PIO_EMAXATTS,
            PioError::Permission => PIO_EPERM,
            PioError::InDefine => PIO_EINDEFINE,
            PioError::NotInDefine => PIO_ENOTINDEFINE,
            PioError::AdiosRead => PIO_EADIOSREAD,
            PioError::AdiosErr => PIO_EADIOS2ERR,
            PioError::Backend(c) => *c,
        }
    }

    /// Reconstruct an error from a code received over the wire.
    pub fn from_code(code: i32) -> Option<PioError> {
        match code {
            PIO_NOERR => None,
            c if c > 0 => Some(PioError::System(c)),
            PIO_EBADID => Some(PioError::BadId),
            PIO_EBADTYPE => Some(PioError::BadType),
            PIO_EBADIOTYPE => Some(PioError::BadIoType),
            PIO_EINVAL => Some(PioError::InvalidArgument),
            PIO_ENOMEM => Some(PioError::NoMemory),
            PIO_ENOTATT => Some(PioError::NotAtt),
            PIO_ENOTVAR => Some(PioError::NotVar),
            PIO_ENOTNC => Some(PioError::NotNc),
            PIO_EIO => Some(PioError::Io),
            PIO_EEXIST => Some(PioError::Exists),
            PIO_EMAXATTS => Some(PioError::MaxAtts),
            PIO_EPERM => Some(PioError::Permission),
            PIO_EINDEFINE => Some(PioError::InDefine),
            PIO_ENOTINDEFINE => Some(PioError::NotInDefine),
            PIO_EADIOSREAD => Some(PioError::AdiosRead),
            PIO_EADIOS2ERR => Some(PioError::AdiosErr),
            c => Some(PioError::Backend(c)),
        }
    }
}

impl From<io::Error> for PioError {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => PioError::System(errno),
            None => PioError::Io,
        }
    }
}

/// Short human-readable string for any code in the uniform space.
pub fn strerror(code: i32) -> String {
    match PioError::from_code(code) {
        None => "no error".to_string(),
        Some(e) => e.to_string(),
    }
}

/// Per-iosystem error handling discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandler {
    /// Abort the process after printing the error string.
    Internal,
    /// Broadcast the root's code so every rank returns the same code.
    Bcast,
    /// Min all-reduce the code; log a per-rank histogram on root.
    Reduce,
    /// Return the code to the caller unchanged.
    Return,
}

impl ErrorHandler {
    pub fn from_i32(v: i32) -> Result<ErrorHandler> {
        match v {
            -51 => Ok(ErrorHandler::Internal),
            -52 => Ok(ErrorHandler::Bcast),
            -53 => Ok(ErrorHandler::Reduce),
            -54 => Ok(ErrorHandler::Return),
            _ => Err(PioError::InvalidArgument),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            ErrorHandler::Internal => -51,
            ErrorHandler::Bcast => -52,
            ErrorHandler::Reduce => -53,
            ErrorHandler::Return => -54,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for e in [
            PioError::BadId,
            PioError::BadType,
            PioError::BadIoType,
            PioError::InvalidArgument,
            PioError::NoMemory,
            PioError::NotAtt,
            PioError::NotVar,
            PioError::Io,
            PioError::Exists,
            PioError::MaxAtts,
            PioError::AdiosRead,
            PioError::AdiosErr,
            PioError::System(13),
            PioError::Backend(-33),
        ] {
            let code = e.code();
            let back = PioError::from_code(code).unwrap();
            assert_eq!(back.code(), code);
        }
    }

    #[test]
    fn test_noerr_is_none() {
        assert!(PioError::from_code(PIO_NOERR).is_none());
        assert_eq!(strerror(PIO_NOERR), "no error");
    }

    #[test]
    fn test_strerror_nonempty() {
        for code in [PIO_EBADID, PIO_EBADTYPE, PIO_EBADIOTYPE, PIO_EINVAL, 2, -33] {
            assert!(!strerror(code).is_empty());
        }
    }

    #[test]
    fn test_handler_codes() {
        for h in [
            ErrorHandler::Internal,
            ErrorHandler::Bcast,
            ErrorHandler::Reduce,
            ErrorHandler::Return,
        ] {
            assert_eq!(ErrorHandler::from_i32(h.as_i32()).unwrap(), h);
        }
        assert!(ErrorHandler::from_i32(0).is_err());
    }
}
