//! Client for a kiln server's NDJSON conversion stream.
//!
//! [`ConversionClient`] owns at most one in-flight stream. Starting a new
//! conversion aborts the previous stream first, which closes its connection
//! and cancels that session server-side, then resets the [`ClientStore`].

pub mod store;
pub mod stream;

use std::sync::Mutex;

use kiln_common::ConversionEvent;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use store::{ClientStore, StoreError};
pub use stream::{LineDecoder, StreamEnd, drive};

pub struct ConversionClient {
    http: reqwest::Client,
    base_url: String,
    store: watch::Sender<ClientStore>,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl ConversionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let (store, _) = watch::channel(ClientStore::default());
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store,
            current: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientStore> {
        self.store.subscribe()
    }

    pub fn snapshot(&self) -> ClientStore {
        self.store.borrow().clone()
    }

    /// Begin a conversion, replacing whatever was running. Returns the new
    /// store epoch.
    pub fn start(&self, source: String) -> u64 {
        self.cancel();

        let mut epoch = 0;
        self.store.send_modify(|store| {
            epoch = store.epoch + 1;
            *store = ClientStore::for_epoch(epoch);
        });

        let http = self.http.clone();
        let url = format!("{}/api/convert", self.base_url);
        let store = self.store.clone();
        let task = tokio::spawn(async move {
            let end = run_stream(&http, &url, source, &store, epoch).await;
            match end {
                StreamEnd::Terminal => {}
                StreamEnd::Truncated => apply(
                    &store,
                    epoch,
                    ConversionEvent::error("Stream ended before the conversion finished", None, Some("transport")),
                ),
                StreamEnd::Failed(message) => {
                    apply(&store, epoch, ConversionEvent::error(message, None, Some("transport")))
                }
            }
        });

        if let Ok(mut current) = self.current.lock() {
            *current = Some(task);
        }
        epoch
    }

    /// Abort the in-flight stream, if any. The store keeps what it had.
    pub fn cancel(&self) {
        let previous = self.current.lock().ok().and_then(|mut current| current.take());
        if let Some(task) = previous {
            task.abort();
            tracing::debug!("previous conversion stream aborted");
        }
    }

    /// Wait until the current session reaches `complete` or `error`.
    pub async fn wait(&self) -> ClientStore {
        let mut rx = self.subscribe();
        match rx.wait_for(|store| store.is_finished()).await {
            Ok(store) => store.clone(),
            Err(_) => self.snapshot(),
        }
    }
}

impl Drop for ConversionClient {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Fold an event into the store if it still belongs to `epoch`.
fn apply(store: &watch::Sender<ClientStore>, epoch: u64, event: ConversionEvent) {
    store.send_if_modified(|s| s.epoch == epoch && s.apply(&event));
}

async fn run_stream(
    http: &reqwest::Client,
    url: &str,
    source: String,
    store: &watch::Sender<ClientStore>,
    epoch: u64,
) -> StreamEnd {
    let response = match http.post(url).json(&json!({ "source": source })).send().await {
        Ok(response) => response,
        Err(e) => return StreamEnd::Failed(format!("Failed to reach kiln server: {}", e)),
    };

    let status = response.status();
    if !status.is_success() {
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body["error"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("Server returned {}", status));
        apply(
            store,
            epoch,
            ConversionEvent::error(message, None, Some(status.as_str())),
        );
        return StreamEnd::Terminal;
    }

    drive(response.bytes_stream(), |event| apply(store, epoch, event)).await
}
