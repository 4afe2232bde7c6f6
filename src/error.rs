//! Errors reported across the host boundary.

use std::fmt;

use cryptoki_sys::CK_RV;

use crate::pkcs11::util::rv_name;


//------------ ErrorKind -----------------------------------------------------

/// The category of an [`Error`].
///
/// This is what a host maps onto its own exception types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// A required argument was missing.
    InvalidArgument,

    /// Host memory could not be allocated.
    HostMemory,

    /// The library could not be opened or is not a PKCS#11 library.
    ModuleLoad,

    /// The PKCS#11 library returned something other than `CKR_OK`.
    Pkcs11,

    /// An opaque handle did not resolve to a live object.
    InvalidHandle,

    /// An operating system primitive failed.
    General,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::HostMemory => "out of memory",
            ErrorKind::ModuleLoad => "module load failure",
            ErrorKind::Pkcs11 => "PKCS#11 failure",
            ErrorKind::InvalidHandle => "invalid handle",
            ErrorKind::General => "general failure",
        };
        f.write_str(s)
    }
}


//------------ Error ---------------------------------------------------------

#[derive(Clone, Debug)]
pub enum Error {
    InvalidArgument(String),
    HostMemory(String),
    ModuleLoad {
        module: String,
        reason: String,
    },
    MissingEntryPoint {
        module: String,
        symbol: &'static str,
    },
    Pkcs11 {
        code: CK_RV,
        message: String,
    },
    InvalidHandle(String),
    General(String),
}

impl Error {
    /// Creates an uncoded error of the given kind.
    ///
    /// `ErrorKind::Pkcs11` requires a code, so it is mapped to
    /// `CKR_GENERAL_ERROR`; use [`Error::coded`] instead.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::InvalidArgument => Error::InvalidArgument(message),
            ErrorKind::HostMemory => Error::HostMemory(message),
            ErrorKind::ModuleLoad => Error::ModuleLoad {
                module: String::new(),
                reason: message,
            },
            ErrorKind::Pkcs11 => Error::coded(cryptoki_sys::CKR_GENERAL_ERROR, message),
            ErrorKind::InvalidHandle => Error::InvalidHandle(message),
            ErrorKind::General => Error::General(message),
        }
    }

    /// Creates an error carrying a foreign result code.
    pub fn coded(code: CK_RV, message: impl Into<String>) -> Self {
        Error::Pkcs11 {
            code,
            message: message.into(),
        }
    }

    pub fn module_load(module: &str, reason: impl fmt::Display) -> Self {
        Error::ModuleLoad {
            module: module.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_handle(kind: &str, handle: u64) -> Self {
        Error::InvalidHandle(format!("{} handle {:#x}", kind, handle))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::HostMemory(_) => ErrorKind::HostMemory,
            Error::ModuleLoad { .. } | Error::MissingEntryPoint { .. } => ErrorKind::ModuleLoad,
            Error::Pkcs11 { .. } => ErrorKind::Pkcs11,
            Error::InvalidHandle(_) => ErrorKind::InvalidHandle,
            Error::General(_) => ErrorKind::General,
        }
    }

    /// Returns the PKCS#11 result code if this is a coded error.
    pub fn code(&self) -> Option<CK_RV> {
        match self {
            Error::Pkcs11 { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::HostMemory(msg) => write!(f, "Out of memory: {}", msg),
            Error::ModuleLoad { module, reason } if module.is_empty() => {
                write!(f, "Cannot open PKCS#11 module: {}", reason)
            }
            Error::ModuleLoad { module, reason } => {
                write!(f, "Cannot open PKCS#11 module {}: {}", module, reason)
            }
            Error::MissingEntryPoint { module, symbol } => {
                write!(f, "Cannot find function {} in PKCS#11 module {}", symbol, module)
            }
            Error::Pkcs11 { code, message } => {
                write!(f, "{} ({}, {:#x})", message, rv_name(*code), code)
            }
            Error::InvalidHandle(msg) => write!(f, "Invalid PKCS#11 {}", msg),
            Error::General(msg) => write!(f, "General failure: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;


//------------ Tests ---------------------------------------------------------
