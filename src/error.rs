/// Errors returned by the field decoder, the stream registry and the
/// per-stream decoder. None of them is fatal: callers log and keep feeding
/// packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A declared tag or set length is out of range.
    #[error("malformed length {length} (max field size {max})")]
    MalformedLength {
        /// The declared length as read from the encoding.
        length: usize,
        /// The largest length accepted for a single field.
        max: usize,
    },

    /// Decoding would read past the end of the known buffer.
    #[error("buffer exceeded: need {need} bytes, have {have}")]
    BufferExceeded {
        /// Bytes the next read required.
        need: usize,
        /// Bytes that were left.
        have: usize,
    },

    /// One of the loop ceilings was hit.
    #[error("iteration limit of {0} exceeded")]
    IterationLimitExceeded(usize),

    /// A long-form tag was followed by another extension byte.
    #[error("consecutive long-form tag bytes at offset {0}")]
    ConsecutiveLongFormTags(usize),

    #[error("invalid stream handle {0}")]
    InvalidHandle(u32),

    #[error("stream registry full")]
    RegistryFull,

    /// The packet's destination port is not registered for the stream.
    #[error("destination port {0} is not on the stream's port list")]
    NotOnPortList(u16),

    /// The stream has no identifier to search for.
    #[error("stream is not configured")]
    StreamNotConfigured,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The packet inspector could not make sense of a raw packet.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// `SetStreamInfo` was given a value of the wrong kind for the item.
    #[error("value does not match stream item {0}")]
    InvalidStreamItem(&'static str),
}

impl Error {
    /// Stable negative status code for callers that report integers.
    pub fn code(&self) -> i32 {
        match self {
            Error::MalformedLength { .. } => -1,
            Error::BufferExceeded { .. } => -2,
            Error::IterationLimitExceeded(_) => -3,
            Error::ConsecutiveLongFormTags(_) => -4,
            Error::InvalidHandle(_) => -5,
            Error::RegistryFull => -6,
            Error::NotOnPortList(_) => -7,
            Error::StreamNotConfigured => -8,
            Error::InvalidArgument(_) => -9,
            Error::MalformedPacket(_) => -10,
            Error::InvalidStreamItem(_) => -11,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
