#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    AddressParseError(#[from] std::net::AddrParseError),

    #[error("invalid config file {path}: {source}")]
    ConfigFile {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid log level \"{0}\"")]
    LogLevel(String),

    #[error(transparent)]
    RewriteRuleError(#[from] crate::rewrite::RuleError),

    #[error(transparent)]
    CertificateError(#[from] crate::tls::Error),

    #[error(transparent)]
    LogFilterError(#[from] tracing_subscriber::filter::ParseError),

    #[error(transparent)]
    SetGlobalDefaultError(#[from] tracing::subscriber::SetGlobalDefaultError),
}
