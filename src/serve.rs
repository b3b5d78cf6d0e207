use crate::{
    cache::CacheStore,
    config::{BootArgs, CaPaths, Config},
    connect::Connector,
    http::http_proxy,
    rewrite::Rewriter,
    tls::{CertificateAuthority, CertificateForge, MitmAcceptor},
    Result,
};
use std::{net::SocketAddr, path::PathBuf};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Run the proxy with the provided boot arguments.
pub fn run(args: BootArgs) -> Result<()> {
    let config = Config::resolve(args)?;

    let filter = EnvFilter::from_default_env()
        .add_directive(config.log.into())
        .add_directive("rustls=warn".parse()?);

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(config.log)
            .with_env_filter(filter)
            .finish(),
    )?;

    tracing::info!("OS: {}", std::env::consts::OS);
    tracing::info!("Arch: {}", std::env::consts::ARCH);
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Concurrent: {}", config.concurrent);
    tracing::info!("Connect timeout: {:?}s", config.connect_timeout);

    let rewriter = Rewriter::parse(config.url_rewrites.iter().map(String::as_str))?;
    if rewriter.is_empty() {
        tracing::info!("URL rewrite rules: none");
    } else {
        tracing::info!("URL rewrite rules: {}", rewriter.len());
    }
    tracing::info!("Cache directory: {}", config.cache_dir.display());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.concurrent)
        .build()?
        .block_on(async {
            let ctx = Context::new(&config, rewriter)?;

            let proxy = format!("http://{}", ctx.bind);
            tracing::info!("export http_proxy={}", proxy);
            if ctx.mitm.is_some() {
                tracing::info!("export https_proxy={}", proxy);
            }

            http_proxy(ctx).await
        })
}

/// Everything a listener needs, built once from [`Config`].
pub struct Context {
    /// Bind address
    pub bind: SocketAddr,

    /// Listen backlog
    pub concurrent: usize,

    /// Ordered URL rewrites
    pub rewriter: Rewriter,

    /// On-disk cache
    pub store: CacheStore,

    /// Connector
    pub connector: Connector,

    /// TLS interception, `None` tunnels CONNECT unmodified
    pub mitm: Option<MitmAcceptor>,
}

impl Context {
    fn new(config: &Config, rewriter: Rewriter) -> std::io::Result<Self> {
        let forge = load_ca(&config.ca).map(|ca| CertificateForge::new(ca, config.cert_cache));

        Ok(Context {
            bind: config.bind,
            concurrent: config.concurrent,
            rewriter,
            store: CacheStore::new(config.cache_dir.clone()),
            connector: Connector::new(config.connect_timeout)?,
            mitm: forge.map(|forge| MitmAcceptor::new(forge, config.connect_timeout)),
        })
    }
}

/// Load the root CA. Any problem leaves the proxy in tunnel-only mode.
fn load_ca(paths: &CaPaths) -> Option<CertificateAuthority> {
    let missing = [&paths.cert, &paths.key]
        .into_iter()
        .filter(|path| !path.exists())
        .collect::<Vec<&PathBuf>>();
    if !missing.is_empty() {
        for path in missing {
            tracing::info!("Root CA file not found: {}", path.display());
        }
        tracing::info!("TLS interception disabled, CONNECT is tunneled as-is");
        return None;
    }

    match CertificateAuthority::from_pem_files(&paths.cert, &paths.key, paths.passphrase.as_deref())
    {
        Ok(ca) => {
            tracing::info!("TLS interception enabled with {}", paths.cert.display());
            Some(ca)
        }
        Err(err) => {
            tracing::warn!(
                "Cannot use root CA {}: {}, CONNECT is tunneled as-is",
                paths.cert.display(),
                err
            );
            None
        }
    }
}
