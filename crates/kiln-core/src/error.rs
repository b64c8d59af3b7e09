#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{table} table is full ({capacity} slots)")]
    TableFull {
        table: &'static str,
        capacity: usize,
    },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for CoreError {
    fn from(e: toml::de::Error) -> Self {
        CoreError::ConfigError(e.to_string())
    }
}
