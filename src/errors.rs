#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("an error occurred with the database connection")]
    Database(#[from] diesel::result::Error),

    #[error("an error occurred connecting to the database")]
    Connection(#[from] diesel::ConnectionError),

    #[error(transparent)]
    Parsing(#[from] ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("an error occurred sending a request")]
    Http(#[from] Box<ureq::Error>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot find source in configuration: {0}")]
    Source(String),
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Error {
        Error::Http(Box::new(err))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    DateFormat(#[from] chrono::ParseError),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config file cannot be read: {0}")]
    Unreadable(String),

    #[error("no database url configured, set DATABASE_URL or [postgres] url")]
    MissingDatabaseUrl,

    #[error("delta directory does not exist: {0}")]
    MissingDeltaDir(String),

    #[error("source \"{0}\" enriches unknown source \"{1}\"")]
    UnknownEnrichmentSource(String, String),

    #[error("enrichment sources form a cycle through \"{0}\"")]
    EnrichmentCycle(String),

    #[error("log sink is unreachable: {0}")]
    UnreachableLogSink(String),
}
