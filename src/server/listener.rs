use super::shim::ProxyShim;
use crate::error::ProxyResult;
use crate::executor::ExecutorFactory;
use opensrv_mysql::AsyncMysqlIntermediary;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

/// MySQL endpoint for one target.
pub struct MysqlProxyServer<F> {
    listener: TcpListener,
    factory: Arc<F>,
}

impl<F> MysqlProxyServer<F>
where
    F: ExecutorFactory,
{
    pub async fn bind(host: &str, port: u16, factory: F) -> ProxyResult<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self {
            listener,
            factory: Arc::new(factory),
        })
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` turns true.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> ProxyResult<()> {
        let addr = self.local_addr()?;
        info!(%addr, "MySQL server listening");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => error!(error = %e, "Failed to accept MySQL connection"),
                },
            }
        }

        info!(%addr, "MySQL server stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        let factory = self.factory.clone();
        let session_id = Uuid::new_v4();
        let span = info_span!("session", %session_id, %peer);

        tokio::spawn(
            async move {
                info!("Client connected");
                let executor = match factory.create().await {
                    Ok(executor) => executor,
                    Err(e) => {
                        error!(error = %e, "Could not build query pipeline, closing connection");
                        return;
                    }
                };

                if let Err(e) = stream.set_nodelay(true) {
                    warn!(error = %e, "Failed to set TCP_NODELAY");
                }
                let (r, w) = stream.into_split();
                let shim = ProxyShim::new(executor);
                match AsyncMysqlIntermediary::run_on(shim, r, w).await {
                    Ok(()) => info!("Client disconnected"),
                    Err(e) => warn!(error = %e, "Connection closed with error"),
                }
            }
            .instrument(span),
        );
    }
}
