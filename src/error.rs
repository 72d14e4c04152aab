use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported or corrupt image: {0}")]
    Decode(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    /// HTTP status the routing layer answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Decode(_) | Error::Invalid(_) => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Storage(_) | Error::Transport(_) => 500,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<warp::Error> for Error {
    fn from(err: warp::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
