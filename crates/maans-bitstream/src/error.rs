#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    UnexpectedEof,
    NonZeroPadding,
    InvalidEnum { name: &'static str, value: u32 },
    ValueOutOfRange { name: &'static str, value: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of bitstream"),
            Self::NonZeroPadding => write!(f, "non-zero bits in byte padding"),
            Self::InvalidEnum { name, value } => {
                write!(f, "invalid {} value {}", name, value)
            }
            Self::ValueOutOfRange { name, value } => {
                write!(f, "{} value {} is not representable", name, value)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
