use crate::config::Config;
use crate::core::connection_pool::{
    optimize_socket_for_latency, ConnectionPool, ConnectionPoolBuilder, Connector, TcpConnector,
};
use crate::core::{BucketRouter, Pipeline, RouteTableBuilder};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub struct ProxyServer {
    config: Arc<Config>,
    listener: TcpListener,
    router: Arc<BucketRouter>,
    pool: Arc<ConnectionPool>,
    pipeline: Pipeline,
}

impl ProxyServer {
    /// Build the bucket table and backend pools, then bind the listener
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        Self::bind_with_connector(config, Arc::new(TcpConnector)).await
    }

    pub async fn bind_with_connector(
        config: Config,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ServerError> {
        let table = RouteTableBuilder::build_from_config(&config)
            .map_err(|e| ServerError::RouteTableBuildFailed(e.to_string()))?;

        let pool = ConnectionPoolBuilder::build_pool(table.addresses(), &config.pool, connector)
            .map_err(|e| ServerError::PoolBuildFailed(e.to_string()))?;

        let router = Arc::new(BucketRouter::new(table));
        let pool = Arc::new(pool);
        let pipeline = Pipeline::new(
            Arc::clone(&router),
            Arc::clone(&pool),
            config.pool.read_timeout(),
            config.pipeline_depth,
        );

        let bind = config.bind_address();
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| ServerError::BindFailed(format!("{}: {}", bind, e)))?;

        info!("Node {} listening on {}", config.node_id, bind);

        Ok(Self {
            config: Arc::new(config),
            listener,
            router,
            pool,
            pipeline,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::IoError(e.to_string()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> Arc<BucketRouter> {
        Arc::clone(&self.router)
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        Arc::clone(&self.pool)
    }

    /// Accept connections forever
    pub async fn run(&self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept().await {
                Ok((client_socket, addr)) => {
                    debug!("New connection from: {}", addr);
                    optimize_socket_for_latency(&client_socket);

                    let pipeline = self.pipeline.clone();
                    tokio::spawn(async move {
                        if let Err(e) = pipeline.serve(client_socket).await {
                            error!("Connection {} error: {}", addr, e);
                        }
                        debug!("Connection from {} closed", addr);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Bind failed: {0}")]
    BindFailed(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Failed to build route table: {0}")]
    RouteTableBuildFailed(String),
    #[error("Failed to build connection pools: {0}")]
    PoolBuildFailed(String),
}
