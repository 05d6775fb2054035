use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Aggregation API error: {0}")]
    Api(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Invalid range: {0}")]
    RangeParse(String),

    #[error("Missing required mappings: {}", .roles.join(", "))]
    Config { roles: Vec<String> },

    #[error("Table not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Configuration error listing the role bindings that resolved empty.
    pub fn missing_roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Error::Config {
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Api(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
