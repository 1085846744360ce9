// The single error taxonomy shared by the virtual machine and the
// code generator.
//
// Errors inside the VM are never recovered locally: the machine state
// latches the first failure and refuses further work until reset. The
// compiler surface reuses the same type, with InternalError marking
// AST shapes that a correct analysis stage can never produce.

use std::fmt;

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;


// A line/column pair pointing into the original MAVL source. Carried
// by Location debug symbols and latched into errors raised during
// instruction execution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: i32,
    pub column: i32,
}

impl SourceLocation {
    pub fn new(line: i32, column: i32) -> SourceLocation {
        SourceLocation { line, column }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidAddress,
    MalformedInstruction,
    StackOverflow,
    StackUnderflow,
    ZeroDivision,
    TypeMismatch,
    RuntimeError,
    IoError,
    InternalError,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::InvalidAddress       => "Invalid Address",
            ErrorKind::MalformedInstruction => "Malformed Instruction",
            ErrorKind::StackOverflow        => "Stack Overflow",
            ErrorKind::StackUnderflow       => "Stack Underflow",
            ErrorKind::ZeroDivision         => "Zero Division",
            ErrorKind::TypeMismatch         => "Type Mismatch",
            ErrorKind::RuntimeError         => "Runtime Error",
            ErrorKind::IoError              => "IO Error",
            ErrorKind::InternalError        => "Internal Error",
        }
    }
}


// An error code plus a human-readable message. `location` is filled
// from the faulting instruction's Location symbol and `address` with
// the faulting CP; both stay None for errors raised outside execution.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{}: {message}", .kind.name())]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Option<SourceLocation>,
    pub address: Option<i32>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            kind,
            message: message.into(),
            location: None,
            address: None,
        }
    }

    pub fn invalid_address(addr: i32) -> Error {
        Error::new(
            ErrorKind::InvalidAddress,
            format!("address {} out of range", addr),
        )
    }

    pub fn internal(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::InternalError, message)
    }

    pub fn io(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::IoError, message)
    }

    pub fn at(mut self, address: i32) -> Error {
        self.address = Some(address);
        self
    }

    pub fn with_location(mut self, location: SourceLocation) -> Error {
        self.location = Some(location);
        self
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::new(ErrorKind::IoError, e.to_string())
    }
}
