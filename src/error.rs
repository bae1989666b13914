use core::fmt;

// Failure classes reported by bring-up code. Interrupt context never builds these; it only
// signals the dispatch loop, which is where errors get reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // a fixed-capacity table (device inventory, message queue, scan work-list) is full
    ResourceExhausted,
    // no matching controller or capability
    NotFound,
    // the request exceeds what the hardware advertises
    Unsupported,
    IndexOutOfRange,
    AlreadyInitialized,
    ControllerNotHalted,
    // a hardware status bit did not settle within the poll limit
    Timeout,
    NotImplemented,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::IndexOutOfRange => "IndexOutOfRange",
            ErrorKind::AlreadyInitialized => "AlreadyInitialized",
            ErrorKind::ControllerNotHalted => "ControllerNotHalted",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::NotImplemented => "NotImplemented",
        }
    }
}

// An error kind plus the source location that raised it, so a log line is enough to find the
// failing check without a debugger. Build it with `make_error!`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    file: &'static str,
    line: u32,
}

impl Error {
    pub const fn new(kind: ErrorKind, file: &'static str, line: u32) -> Self {
        Error { kind, file, line }
    }
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
    pub fn file(&self) -> &'static str {
        self.file
    }
    pub fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.kind.name(), self.file, self.line)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[macro_export]
macro_rules! make_error {
    ($kind:expr) => {
        $crate::error::Error::new($kind, file!(), line!())
    };
}
