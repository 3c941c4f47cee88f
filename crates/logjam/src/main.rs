// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use std::{env, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logjam_intake::{
    config::Config,
    dispatcher::DispatcherService,
    intake_server::IntakeServer,
    sink::ConsoleSink,
};

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let log_level = env::var("LOGJAM_LOG_LEVEL")
        .map(|val| val.trim().to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,{}", log_level);

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on logjam startup: {e}");
            return Err(e.into());
        }
    };

    // The server stops first so requests already being read can still be admitted, then the
    // dispatcher drains everything admitted.
    let server_cancel = CancellationToken::new();
    let dispatcher_cancel = CancellationToken::new();
    let (dispatcher_service, dispatcher) =
        DispatcherService::new(Arc::new(ConsoleSink::stdout()), config.dispatcher.clone());
    let dispatcher_handle = tokio::spawn(dispatcher_service.run(dispatcher_cancel.clone()));

    let server = IntakeServer::new(&config, dispatcher);
    let bind_address = config.bind_address();
    let mut server_handle = {
        let server_cancel = server_cancel.clone();
        tokio::spawn(async move { server.start(&bind_address, server_cancel).await })
    };

    // the server only returns early when it cannot bind or accept
    let served = tokio::select! {
        () = wait_for_shutdown_signal() => {
            server_cancel.cancel();
            server_handle.await
        }
        finished = &mut server_handle => finished,
    }
    .context("intake server task failed")?;

    dispatcher_cancel.cancel();
    if let Err(e) = dispatcher_handle.await {
        error!("Dispatcher task failed: {e}");
    }
    served.context("intake server stopped with an error")?;

    info!("Logjam stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                return wait_for_ctrl_c().await;
            }
        };
        tokio::select! {
            () = wait_for_ctrl_c() => {}
            _ = terminate.recv() => info!("Received SIGTERM, initiating shutdown"),
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
        Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
    }
}
