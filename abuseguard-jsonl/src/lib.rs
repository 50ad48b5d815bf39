//! JSONL sink for `abuseguard`. Writes one security event per line.
//! Always appends; bring your own path.

use abuseguard::telemetry::{SecurityEvent, SecuritySink};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<SecurityEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SecurityEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event.to_json().to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(target: "abuseguard::jsonl", path = %path.display(), "security event appended");
            Ok(())
        })
    }
}

impl SecuritySink for JsonlSink {
    type SinkError = io::Error;
}
