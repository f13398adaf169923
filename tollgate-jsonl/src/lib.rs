//! JSONL sink for `tollgate` violations. Appends one record per line.
//! Bring your own path; rotation is left to the host.

use futures::future::BoxFuture;
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::task::{Context, Poll};
use tollgate::violation::{ViolationRecord, ViolationSink};

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

impl tower_service::Service<ViolationRecord> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = BoxFuture<'static, Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: ViolationRecord) -> Self::Future {
        let path = self.path.clone();
        let line = record_to_json(&record).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(target: "tollgate::violation", path = %path.display(), "violation appended");
            Ok(())
        })
    }
}

impl ViolationSink for JsonlSink {
    type SinkError = io::Error;
}

fn record_to_json(record: &ViolationRecord) -> serde_json::Value {
    json!({
        "kind": "rate_limit_violation",
        "scope": record.scope,
        "identifier": record.identifier,
        "path": record.path,
        "method": record.method,
        "timestamp_ms": record.timestamp_millis() as u64,
    })
}
