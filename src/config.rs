//! Configuration resolution.
//!
//! Every setting is taken from, in order of precedence: the command line,
//! the matching `VCACHE_*` environment variable, the JSON config file, and
//! finally the built-in default. Resolution happens once at startup.

use crate::{error::Error, Result};
use clap::Args;
use serde::Deserialize;
use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_CONNECT_TIMEOUT: u64 = 10;
const DEFAULT_CONCURRENT: usize = 1024;

/// Root CA locations, shared by `run` and `gen-ca`.
#[derive(Args, Clone, Debug, Default)]
pub struct CaArgs {
    /// Root CA private key (PEM) used to sign intercepted hosts
    #[clap(long, env = "VCACHE_ROOT_CA_KEY")]
    pub root_ca_key: Option<PathBuf>,

    /// Root CA certificate (PEM)
    #[clap(long, env = "VCACHE_ROOT_CA_CERT")]
    pub root_ca_cert: Option<PathBuf>,

    /// Passphrase of an encrypted root CA key
    #[clap(long, env = "VCACHE_ROOT_CA_PASSPHRASE", hide_env_values = true)]
    pub root_ca_passphrase: Option<String>,
}

#[derive(Args, Clone, Debug, Default)]
pub struct BootArgs {
    /// JSON config file [default: $HOME/.config/vcache/config.json]
    #[clap(long, env = "VCACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level e.g. trace, debug, info, warn, error [default: info]
    #[clap(long, env = "VCACHE_LOG")]
    pub log: Option<tracing::Level>,

    /// Bind address [default: 127.0.0.1:8080]
    #[clap(short, long, env = "VCACHE_BIND")]
    pub bind: Option<SocketAddr>,

    /// Cache directory [default: $HOME/.cache/vcache]
    #[clap(long, env = "VCACHE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    #[clap(flatten)]
    pub ca: CaArgs,

    /// Whitespace separated rewrite rules, each `<d>pattern<d>replacement<d>`
    #[clap(long, env = "VCACHE_URL_REWRITES")]
    pub url_rewrites: Option<String>,

    /// Connection timeout in seconds [default: 10]
    #[clap(short = 'T', long, env = "VCACHE_CONNECT_TIMEOUT")]
    pub connect_timeout: Option<u64>,

    /// Concurrent connections [default: 1024]
    #[clap(short, long, env = "VCACHE_CONCURRENT")]
    pub concurrent: Option<usize>,

    /// Forged certificates kept in memory, 0 forges one per handshake [default: 0]
    #[clap(long, env = "VCACHE_CERT_CACHE")]
    pub cert_cache: Option<u64>,
}

/// `url_rewrites` in the config file: one string or a list of strings.
#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum RewriteList {
    One(String),
    Many(Vec<String>),
}

/// Contents of the JSON config file. Unknown keys are ignored.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ConfigFile {
    pub bind: Option<SocketAddr>,
    pub cache_dir: Option<PathBuf>,
    pub root_ca_key: Option<PathBuf>,
    pub root_ca_cert: Option<PathBuf>,
    pub root_ca_passphrase: Option<String>,
    pub url_rewrites: Option<RewriteList>,
    pub connect_timeout: Option<u64>,
    pub concurrent: Option<usize>,
    pub cert_cache: Option<u64>,
    pub log: Option<String>,
}

impl ConfigFile {
    /// Read `path`, or the default location when `None`. A missing file is an
    /// empty config; a file that does not parse is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_file);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("no config file at {}", path.display());
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };

        serde_json::from_slice(&content).map_err(|source| Error::ConfigFile { path, source })
    }
}

/// Where the root CA lives and how to unlock it.
#[derive(Clone, Debug, PartialEq)]
pub struct CaPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub passphrase: Option<String>,
}

impl CaArgs {
    pub fn resolve(self, file: &ConfigFile) -> CaPaths {
        CaPaths {
            cert: self
                .root_ca_cert
                .or_else(|| file.root_ca_cert.clone())
                .unwrap_or_else(|| config_home().join("rootCA.pem")),
            key: self
                .root_ca_key
                .or_else(|| file.root_ca_key.clone())
                .unwrap_or_else(|| config_home().join("rootCA.key")),
            passphrase: self
                .root_ca_passphrase
                .or_else(|| file.root_ca_passphrase.clone()),
        }
    }
}

/// Immutable process configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub log: tracing::Level,
    pub bind: SocketAddr,
    pub cache_dir: PathBuf,
    pub ca: CaPaths,
    pub url_rewrites: Vec<String>,
    pub connect_timeout: u64,
    pub concurrent: usize,
    pub cert_cache: u64,
}

impl Config {
    pub fn resolve(args: BootArgs) -> Result<Self> {
        let file = ConfigFile::load(args.config.as_deref())?;
        Self::merge(args, file)
    }

    fn merge(args: BootArgs, file: ConfigFile) -> Result<Self> {
        let log = match (args.log, &file.log) {
            (Some(level), _) => level,
            (None, Some(level)) => level
                .parse()
                .map_err(|_| Error::LogLevel(level.clone()))?,
            (None, None) => tracing::Level::INFO,
        };

        let bind = match args.bind.or(file.bind) {
            Some(bind) => bind,
            None => DEFAULT_BIND.parse()?,
        };

        let url_rewrites = match (args.url_rewrites, &file.url_rewrites) {
            (Some(rules), _) => vec![rules],
            (None, Some(RewriteList::One(rules))) => vec![rules.clone()],
            (None, Some(RewriteList::Many(rules))) => rules.clone(),
            (None, None) => Vec::new(),
        };

        Ok(Config {
            log,
            bind,
            cache_dir: args
                .cache_dir
                .or_else(|| file.cache_dir.clone())
                .unwrap_or_else(|| home_dir().join(".cache").join(crate::BIN_NAME)),
            ca: args.ca.resolve(&file),
            url_rewrites,
            connect_timeout: args
                .connect_timeout
                .or(file.connect_timeout)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            concurrent: args
                .concurrent
                .or(file.concurrent)
                .unwrap_or(DEFAULT_CONCURRENT),
            cert_cache: args.cert_cache.or(file.cert_cache).unwrap_or(0),
        })
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn config_home() -> PathBuf {
    home_dir().join(".config").join(crate::BIN_NAME)
}

fn default_config_file() -> PathBuf {
    config_home().join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::merge(BootArgs::default(), ConfigFile::default()).unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.log, tracing::Level::INFO);
        assert_eq!(config.connect_timeout, 10);
        assert_eq!(config.concurrent, 1024);
        assert_eq!(config.cert_cache, 0);
        assert!(config.url_rewrites.is_empty());
        assert!(config.cache_dir.ends_with(".cache/vcache"));
        assert!(config.ca.cert.ends_with(".config/vcache/rootCA.pem"));
        assert!(config.ca.key.ends_with(".config/vcache/rootCA.key"));
        assert_eq!(config.ca.passphrase, None);
    }

    #[test]
    fn test_file_overrides_defaults_and_args_override_file() {
        let file = write_config(
            r##"{
                "bind": "0.0.0.0:3128",
                "cache_dir": "/var/cache/vcache",
                "url_rewrites": ["#a#b#", "#c#d#"],
                "connect_timeout": 3,
                "log": "debug",
                "root_ca_passphrase": "secret"
            }"##,
        );
        let file = ConfigFile::load(Some(file.path())).unwrap();

        let config = Config::merge(BootArgs::default(), file.clone()).unwrap();
        assert_eq!(config.bind, "0.0.0.0:3128".parse().unwrap());
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/vcache"));
        assert_eq!(config.url_rewrites, vec!["#a#b#", "#c#d#"]);
        assert_eq!(config.connect_timeout, 3);
        assert_eq!(config.log, tracing::Level::DEBUG);
        assert_eq!(config.ca.passphrase.as_deref(), Some("secret"));

        let args = BootArgs {
            bind: Some("127.0.0.1:9000".parse().unwrap()),
            url_rewrites: Some("|x|y|".to_owned()),
            ..Default::default()
        };
        let config = Config::merge(args, file).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.url_rewrites, vec!["|x|y|"]);
        assert_eq!(config.connect_timeout, 3);
    }

    #[test]
    fn test_url_rewrites_as_single_string() {
        let file = write_config(r##"{"url_rewrites": "#a#b# #c#d#"}"##);
        let file = ConfigFile::load(Some(file.path())).unwrap();
        let config = Config::merge(BootArgs::default(), file).unwrap();
        assert_eq!(config.url_rewrites, vec!["#a#b# #c#d#"]);
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert!(file.bind.is_none());
        assert!(file.url_rewrites.is_none());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let file = write_config("{ not json");
        assert!(matches!(
            ConfigFile::load(Some(file.path())),
            Err(Error::ConfigFile { .. })
        ));
    }

    #[test]
    fn test_invalid_log_level_in_file() {
        let file = ConfigFile {
            log: Some("loud".to_owned()),
            ..Default::default()
        };
        assert!(Config::merge(BootArgs::default(), file).is_err());
    }
}
