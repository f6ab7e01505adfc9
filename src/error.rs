use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while opening, linking or loading an
/// object. The set is closed: callers can match exhaustively to decide
/// between "bad input", "kernel said no" and "bug in this library".
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The external object reader rejected the input outright.
    #[snafu(display("object reader: {source}"))]
    Reader { source: goblin::error::Error },

    #[snafu(display("malformed object: {what}"))]
    Format { what: String },

    #[snafu(display("object endianness does not match the host"))]
    Endian,

    /// The kernel verifier rejected the program and produced a log.
    #[snafu(display("kernel verifier rejected program '{name}':\n{log}"))]
    Verify { name: String, log: String },

    #[snafu(display("program '{name}' has {count} instructions, over the kernel limit"))]
    ProgramTooBig { name: String, count: usize },

    /// A program kind in this object requires a kernel-version tag and the
    /// object does not carry one.
    #[snafu(display("object does not declare a kernel version"))]
    MissingKernelVersion,

    /// Submission failed for the declared kind but succeeded when probed
    /// as a kprobe, so the declared kind was wrong.
    #[snafu(display("program '{name}' was declared with the wrong kind"))]
    WrongProgramKind { name: String },

    #[snafu(display("failed to load program '{name}': {reason}"))]
    Load { name: String, reason: LoadFailReason },

    #[snafu(display("relocation: {what}"))]
    Reloc { what: String },

    #[snafu(display("internal invariant violated: {what}"))]
    Internal { what: String },

    #[snafu(display("invalid input: {what}"))]
    InvalidInput { what: String },

    #[snafu(display("not found: {what}"))]
    NotFound { what: String },

    #[snafu(display("path too long: {path}"))]
    NameTooLong { path: String },

    /// An operating-system call failed; carries the original errno.
    #[snafu(display("{op}: {source}"))]
    Os {
        op: &'static str,
        source: std::io::Error,
    },
}

/// Sub-reason attached to [`Error::Load`] when no sharper kind applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailReason {
    /// Submission failed and nothing narrowed the cause down.
    Unclassified,
    /// Kernel version mismatch, or another rejection the wrong-kind probe
    /// could not explain.
    KernelMismatch,
}

impl std::fmt::Display for LoadFailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadFailReason::Unclassified => write!(f, "submission failed"),
            LoadFailReason::KernelMismatch => {
                write!(f, "kernel version mismatch or unsupported program")
            }
        }
    }
}

impl Error {
    #[cold]
    pub(crate) fn short_read(size: usize) -> Self {
        Error::Format {
            what: format!("attempted to read {size} bytes past the end of input"),
        }
    }

    #[cold]
    pub(crate) fn short_write(size: usize) -> Self {
        Error::Internal {
            what: format!("attempted to write {size} bytes past the end of a buffer"),
        }
    }
}
