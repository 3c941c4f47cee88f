// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::record::LogRecord;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink rejected record: {0}")]
    Rejected(String),
}

/// Destination for accepted records. Implementations may be slow or fail; the dispatcher keeps
/// both away from the request path.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, record: LogRecord) -> Result<(), SinkError>;
}

/// Writes one `FieldNames: a, b, c` line per record.
pub struct ConsoleSink<W> {
    writer: Mutex<W>,
}

impl ConsoleSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> ConsoleSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

pub fn format_field_names(record: &LogRecord) -> String {
    format!("FieldNames: {}", record.field_names().join(", "))
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Sink for ConsoleSink<W> {
    async fn deliver(&self, record: LogRecord) -> Result<(), SinkError> {
        let line = format!("{}\n", format_field_names(&record));
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}
