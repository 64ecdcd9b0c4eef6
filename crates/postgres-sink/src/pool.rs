//! Bounded connection pool shared by every partition worker.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use target_sink::TargetError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::{Client, NoTls};

/// Connection settings for the target database.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub url: String,
    /// Maximum number of open connections
    pub size: usize,
    /// Connection attempts before giving up on one `get`
    pub connect_attempts: u32,
    /// First reconnect delay; doubles per attempt
    pub connect_backoff: Duration,
    /// Upper bound for the reconnect delay
    pub max_connect_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: "host=localhost user=postgres dbname=target".to_string(),
            size: 4,
            connect_attempts: 5,
            connect_backoff: Duration::from_secs(1),
            max_connect_backoff: Duration::from_secs(30),
        }
    }
}

struct Inner {
    config: PoolConfig,
    idle: Mutex<Vec<Client>>,
    permits: Arc<Semaphore>,
}

/// At most `size` connections exist at once; callers wait for a free slot.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<Inner>,
}

impl PgPool {
    pub fn new(config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.size.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                idle: Mutex::new(Vec::new()),
                permits,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a connection, reusing an idle one when it is still open.
    pub async fn get(&self) -> Result<PooledClient, TargetError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| TargetError::Unavailable("connection pool closed".to_string()))?;

        while let Some(client) = self.pop_idle() {
            if !client.is_closed() {
                return Ok(PooledClient::new(client, permit, Arc::clone(&self.inner)));
            }
            tracing::debug!("Discarding closed target connection");
        }

        let client = self.connect_with_backoff().await?;
        Ok(PooledClient::new(client, permit, Arc::clone(&self.inner)))
    }

    fn pop_idle(&self) -> Option<Client> {
        self.inner.idle.lock().ok()?.pop()
    }

    async fn connect_with_backoff(&self) -> Result<Client, TargetError> {
        let config = &self.inner.config;
        let mut delay = config.connect_backoff;
        let mut last_error = String::new();

        for attempt in 1..=config.connect_attempts.max(1) {
            match tokio_postgres::connect(&config.url, NoTls).await {
                Ok((client, connection)) => {
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            tracing::error!("Target connection error: {e}");
                        }
                    });
                    if attempt > 1 {
                        tracing::info!("Connected to target database after {attempt} attempts");
                    }
                    return Ok(client);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < config.connect_attempts {
                        tracing::warn!(
                            "Target connection attempt {}/{} failed: {}. Retrying in {:?}",
                            attempt,
                            config.connect_attempts,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(config.max_connect_backoff);
                    }
                }
            }
        }

        Err(TargetError::Unavailable(format!(
            "could not connect after {} attempts: {last_error}",
            config.connect_attempts
        )))
    }
}

/// A checked-out connection. Returned to the pool on drop unless closed.
pub struct PooledClient {
    client: Option<Client>,
    inner: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    fn new(client: Client, permit: OwnedSemaphorePermit, inner: Arc<Inner>) -> Self {
        Self {
            client: Some(client),
            inner,
            _permit: permit,
        }
    }

    /// Drop the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        self.client = None;
    }
}

impl Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        // Only `discard` and `drop` take the client, and both consume self.
        self.client.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledClient {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if client.is_closed() {
                return;
            }
            if let Ok(mut idle) = self.inner.idle.lock() {
                idle.push(client);
            }
        }
    }
}
