#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is full ({capacity} draws)")]
    FrameFull { capacity: usize },

    #[error("draw has no {0} buffer")]
    MissingBuffer(&'static str),

    #[error("draw binds {count} descriptors, at most {max} are allowed")]
    TooManyDescriptors { count: usize, max: usize },

    #[error("invalid shader reflection: {0}")]
    InvalidReflection(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
