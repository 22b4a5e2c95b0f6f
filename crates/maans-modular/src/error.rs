/// Broad failure categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Header, tree, or entropy stream is malformed.
    MalformedStream,
    /// The image (or transform metadata) signalled corruption.
    InvalidImage,
    /// Encoder-internal invariant violated by the caller's configuration.
    LogicError,
    /// The underlying bit reader or writer failed.
    Io,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    InvalidMaTree,
    GlobalMaTreeNotAvailable,
    UnsupportedTransform,
    InvalidImage,
    LogicError(&'static str),
    Bitstream(maans_bitstream::Error),
    Coding(maans_coding::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMaTree
            | Self::GlobalMaTreeNotAvailable
            | Self::UnsupportedTransform => ErrorKind::MalformedStream,
            Self::InvalidImage => ErrorKind::InvalidImage,
            Self::LogicError(_) => ErrorKind::LogicError,
            Self::Bitstream(maans_bitstream::Error::UnexpectedEof) => ErrorKind::Io,
            Self::Bitstream(_) => ErrorKind::MalformedStream,
            Self::Coding(maans_coding::Error::Bitstream(
                maans_bitstream::Error::UnexpectedEof,
            )) => ErrorKind::Io,
            Self::Coding(_) => ErrorKind::MalformedStream,
        }
    }
}

impl From<maans_bitstream::Error> for Error {
    fn from(err: maans_bitstream::Error) -> Self {
        Self::Bitstream(err)
    }
}

impl From<maans_coding::Error> for Error {
    fn from(err: maans_coding::Error) -> Self {
        Self::Coding(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMaTree => write!(f, "invalid meta-adaptive tree"),
            Self::GlobalMaTreeNotAvailable => {
                write!(f, "global meta-adaptive tree requested but unavailable")
            }
            Self::UnsupportedTransform => write!(f, "unsupported transform in stream"),
            Self::InvalidImage => write!(f, "corrupt image"),
            Self::LogicError(msg) => write!(f, "logic error: {}", msg),
            Self::Bitstream(err) => write!(f, "bitstream error: {}", err),
            Self::Coding(err) => write!(f, "entropy coder error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bitstream(err) => Some(err),
            Self::Coding(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
