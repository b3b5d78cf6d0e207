pub mod error;
mod forward;
mod server;

use server::Server;

use crate::serve::Context;

pub async fn http_proxy(ctx: Context) -> crate::Result<()> {
    let server = Server::new(ctx)?;
    tracing::info!("HTTP proxy server listening on {}", server.local_addr()?);
    server.serve().await
}
