//! S3-compatible node transport.
//!
//! Each storage node is an independent S3-compatible endpoint (MinIO in the
//! reference deployment). Namespaces map to buckets on that endpoint.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Builder, Credentials, Region, SharedCredentialsProvider},
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::transport::{NodeConnector, NodeTransport, TransportError, TransportResult};
use crate::TransportConfig;

fn is_missing(err: &str) -> bool {
    err.contains("NoSuchKey") || err.contains("NotFound") || err.contains("404")
}

/// Transport for one S3-compatible node
pub struct S3Transport {
    client: Client,
    endpoint: String,
}

impl S3Transport {
    /// Build a client for `endpoint` with the given credentials provider
    pub fn new(
        endpoint: &str,
        config: &TransportConfig,
        credentials: Option<SharedCredentialsProvider>,
    ) -> Self {
        let mut builder = Builder::new()
            .region(Region::new(config.region.clone()))
            .force_path_style(config.force_path_style)
            .endpoint_url(endpoint);

        if let Some(creds) = credentials {
            builder = builder.credentials_provider(creds);
        }

        Self {
            client: Client::from_conf(builder.build()),
            endpoint: endpoint.to_string(),
        }
    }

    /// Endpoint URL this transport talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl NodeTransport for S3Transport {
    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> TransportResult<()> {
        self.client
            .put_object()
            .bucket(namespace)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("NoSuchBucket") {
                    TransportError::Namespace(namespace.to_string())
                } else {
                    TransportError::Transport(err_str)
                }
            })?;

        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> TransportResult<Bytes> {
        let result = self
            .client
            .get_object()
            .bucket(namespace)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if is_missing(&err_str) {
                    TransportError::NotFound(format!("{}/{}", namespace, key))
                } else {
                    TransportError::Transport(err_str)
                }
            })?;

        let data = result
            .body
            .collect()
            .await
            .map_err(|e| TransportError::Transport(e.to_string()))?;

        Ok(data.into_bytes())
    }

    async fn delete(&self, namespace: &str, key: &str) -> TransportResult<()> {
        self.client
            .delete_object()
            .bucket(namespace)
            .key(key)
            .send()
            .await
            .map_err(|e| TransportError::Transport(e.to_string()))?;

        Ok(())
    }

    async fn head(&self, namespace: &str, key: &str) -> TransportResult<bool> {
        match self
            .client
            .head_object()
            .bucket(namespace)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let err_str = e.to_string();
                if is_missing(&err_str) {
                    Ok(false)
                } else {
                    Err(TransportError::Transport(err_str))
                }
            }
        }
    }

    async fn ensure_namespace(&self, namespace: &str) -> TransportResult<()> {
        if self
            .client
            .head_bucket()
            .bucket(namespace)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }

        info!(endpoint = %self.endpoint, bucket = namespace, "Creating bucket");

        match self.client.create_bucket().bucket(namespace).send().await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err_str = e.to_string();
                // Lost a race with another creator
                if err_str.contains("BucketAlreadyOwnedByYou") || err_str.contains("BucketAlreadyExists") {
                    Ok(())
                } else {
                    Err(TransportError::Namespace(format!("{}: {}", namespace, err_str)))
                }
            }
        }
    }

    async fn probe(&self) -> TransportResult<Duration> {
        let start = Instant::now();
        self.client
            .list_buckets()
            .send()
            .await
            .map_err(|e| TransportError::Transport(e.to_string()))?;
        Ok(start.elapsed())
    }
}

/// Connector that hands out one cached S3 client per node URL
pub struct S3Connector {
    config: TransportConfig,
    credentials: Option<SharedCredentialsProvider>,
    clients: RwLock<HashMap<String, Arc<S3Transport>>>,
}

impl S3Connector {
    /// Create a connector. Static credentials in `config` win; otherwise the
    /// standard AWS environment chain is consulted once.
    pub async fn new(config: TransportConfig) -> Self {
        let credentials = match (&config.access_key, &config.secret_key) {
            (Some(access), Some(secret)) => Some(SharedCredentialsProvider::new(Credentials::new(
                access, secret, None, None, "static",
            ))),
            _ => {
                let sdk_config = aws_config::load_from_env().await;
                sdk_config.credentials_provider()
            }
        };

        Self {
            config,
            credentials,
            clients: RwLock::new(HashMap::new()),
        }
    }
}

impl NodeConnector for S3Connector {
    fn transport(&self, node_url: &str) -> TransportResult<Arc<dyn NodeTransport>> {
        if let Some(client) = self.clients.read().get(node_url) {
            return Ok(client.clone());
        }

        debug!(endpoint = node_url, "Creating S3 client");
        let client = self
            .clients
            .write()
            .entry(node_url.to_string())
            .or_insert_with(|| {
                Arc::new(S3Transport::new(
                    node_url,
                    &self.config,
                    self.credentials.clone(),
                ))
            })
            .clone();

        Ok(client)
    }
}
