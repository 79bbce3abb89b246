use std::{sync::Arc, time::Duration};

use anyhow::Context;
use reqwest::{Client, Request, Response};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::app_state::AppError;

/// Rate limited HTTP request client.
///
/// Cloned instances share the limit: `limit_number` requests may be in
/// flight per `limit_duration` window.
#[derive(Debug, Clone)]
pub struct LimitedRequestClient {
    request_tx: mpsc::Sender<QueuedRequest>,
}

#[derive(Debug)]
struct QueuedRequest {
    req: Request,
    res: oneshot::Sender<reqwest::Result<Response>>,
}

impl LimitedRequestClient {
    pub fn new(client: Client, limit_number: usize, limit_duration: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueuedRequest>(100);
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(limit_number));
            while let Some(QueuedRequest { req, res }) = rx.recv().await {
                let semaphore = semaphore.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    let permit = semaphore
                        .acquire()
                        .await
                        .expect("limiter semaphore is never closed");
                    let response = client.execute(req).await;
                    if res.send(response).is_err() {
                        tracing::trace!("Rate limited response receiver dropped");
                    }
                    // Holding the permit through the sleep is what turns
                    // "concurrency" into "requests per window"
                    tokio::time::sleep(limit_duration).await;
                    drop(permit);
                });
            }
        });
        Self { request_tx: tx }
    }

    pub async fn request<T>(&self, req: Request) -> Result<T, AppError>
    where
        T: DeserializeOwned,
    {
        let url = req.url().to_string();
        let response = self.request_raw(req).await?;
        match response.json().await {
            Ok(res) => Ok(res),
            Err(e) => {
                tracing::warn!(url, "Failed to deserialize fetch response: {e}");
                Err(AppError::internal_error(
                    "failed to deserialize response json body",
                ))
            }
        }
    }

    pub async fn request_raw(&self, req: Request) -> Result<Response, AppError> {
        let (tx, rx) = oneshot::channel();
        let url = req.url().to_string();
        self.request_tx
            .send(QueuedRequest { req, res: tx })
            .await
            .context("request limiter loop is gone")?;
        let response = rx
            .await
            .map_err(|e| anyhow::anyhow!("failed to receive response: {e}"))?
            .map_err(|e| anyhow::anyhow!("request to {url} failed: {e}"))?;
        tracing::trace!(status = response.status().as_u16(), url, "Provider response");
        match response.status().as_u16() {
            200..=299 => Ok(response),
            404 => Err(AppError::not_found("provider responded with 404")),
            rest => Err(anyhow::anyhow!("provider responded with status {rest}").into()),
        }
    }
}
