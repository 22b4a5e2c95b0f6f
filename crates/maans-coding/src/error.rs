#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    Lz77NotSupported,
    InvalidClusterMap,
    InvalidIntegerConfig,
    InvalidAnsHistogram,
    InvalidAnsStream,
    Bitstream(maans_bitstream::Error),
}

impl From<maans_bitstream::Error> for Error {
    fn from(err: maans_bitstream::Error) -> Self {
        Self::Bitstream(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lz77NotSupported => write!(f, "stream uses LZ77, which is not supported"),
            Self::InvalidClusterMap => write!(f, "invalid context cluster map"),
            Self::InvalidIntegerConfig => write!(f, "invalid hybrid integer configuration"),
            Self::InvalidAnsHistogram => write!(f, "invalid ANS histogram"),
            Self::InvalidAnsStream => write!(f, "ANS stream final state mismatch"),
            Self::Bitstream(err) => write!(f, "bitstream error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bitstream(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
