// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP intake for log events.
//!
//! Requests are authenticated against a fixed token set, their bodies are decoded into
//! [`record::LogRecord`]s under a strict JSON policy, and every accepted record is handed to a
//! [`sink::Sink`] through the [`dispatcher::Dispatcher`] without making the caller wait for the
//! sink.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod auth;
pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod http_utils;
pub mod intake_server;
pub mod record;
pub mod sink;
