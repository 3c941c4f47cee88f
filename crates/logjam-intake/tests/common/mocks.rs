// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sink implementations for testing

use async_trait::async_trait;
use logjam_intake::record::LogRecord;
use logjam_intake::sink::{Sink, SinkError};
use std::sync::Mutex;
use std::time::Duration;

/// Sink that keeps every record it receives
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<LogRecord>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn deliver(&self, record: LogRecord) -> Result<(), SinkError> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

/// Sink that sleeps before recording
pub struct SleepingSink {
    pub delay: Duration,
    pub inner: RecordingSink,
}

impl SleepingSink {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: RecordingSink::default(),
        }
    }
}

#[async_trait]
impl Sink for SleepingSink {
    async fn deliver(&self, record: LogRecord) -> Result<(), SinkError> {
        tokio::time::sleep(self.delay).await;
        self.inner.deliver(record).await
    }
}

/// Sink that fails every delivery
pub struct FailingSink;

#[async_trait]
impl Sink for FailingSink {
    async fn deliver(&self, _record: LogRecord) -> Result<(), SinkError> {
        Err(SinkError::Rejected("mock failure".to_string()))
    }
}
