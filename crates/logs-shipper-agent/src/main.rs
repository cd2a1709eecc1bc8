// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

use logs_shipper::{
    config::{self, Config},
    event_bus::LifecycleBus,
    file_batcher::FileStreamBatcher,
    file_streamer::FileStreamer,
    logger::{Formatter, QueueLayer},
    publisher::Publisher,
    queue::LogQueue,
    sink::{http::HttpLogsApiFactory, SinkClient},
};

const CONFIG_DIR_ENV: &str = "LOGS_SHIPPER_CONFIG_DIR";
const FILE_STREAMING_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[tokio::main]
pub async fn main() {
    let config_dir = env::var(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    let config = match config::get_config(&config_dir) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("LOGS_SHIPPER | ERROR | {e}");
            return;
        }
    };

    let queue = Arc::new(LogQueue::new(Arc::new(LifecycleBus::new())));

    let env_filter = match EnvFilter::try_new(config.log_level.env_filter_directive()) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("LOGS_SHIPPER | ERROR | could not parse log level in configuration: {e}");
            return;
        }
    };
    let subscriber = Registry::default()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(Formatter)
                .with_writer(std::io::stderr),
        )
        .with(QueueLayer::new(Arc::clone(&queue)));
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("LOGS_SHIPPER | ERROR | setting default subscriber failed: {e}");
        return;
    }
    debug!("Logging subsystem enabled");

    let factory = Arc::new(HttpLogsApiFactory::new(
        config.endpoint(),
        config.request_timeout(),
        config.max_transport_retries,
    ));

    queue.create(config.queue_config());
    let publisher = Arc::new(Publisher::new(
        config.publisher_config(),
        Arc::clone(&queue),
        factory.clone(),
    ));
    let listener = publisher.init().await;

    let (file_complete_tx, file_complete_rx) = watch::channel(false);
    let streaming = config
        .stream_file
        .clone()
        .map(|path| spawn_file_streaming(&config, factory, path, file_complete_rx));

    info!("Logs shipper started, shipping to {}", config.endpoint());
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutting down logs shipper");

    let _ = file_complete_tx.send(true);
    if let Some(streaming) = streaming {
        let abort = streaming.abort_handle();
        match tokio::time::timeout(FILE_STREAMING_GRACE_PERIOD, streaming).await {
            Ok(Ok(Ok(()))) => debug!("File streaming finished"),
            Ok(Ok(Err(e))) => warn!("File streaming stopped: {e}"),
            Ok(Err(e)) => error!("File streaming task failed: {e}"),
            Err(_) => {
                warn!("File streaming did not finish in time, abandoning remaining lines");
                abort.abort();
            }
        }
    }

    publisher.stop().await;
    listener.abort();
    let dropped = queue.destroy();
    if dropped > 0 {
        warn!("Dropped {dropped} undelivered events on shutdown");
    }
}

fn spawn_file_streaming(
    config: &Config,
    factory: Arc<HttpLogsApiFactory>,
    path: PathBuf,
    file_complete: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<Result<(), logs_shipper::file_streamer::StreamError>> {
    let client = Arc::new(SinkClient::new(
        factory,
        None,
        config.stop_policy_threshold,
    ));
    let streamer = FileStreamer::new(
        client,
        FileStreamBatcher::default()
            .with_control_character_stripping(config.strip_control_characters),
    )
    .with_interval(config.streaming_interval());
    let log_group = config.log_group.clone();
    let log_stream = format!("{}-file", config.instance_id);

    tokio::spawn(async move {
        streamer
            .stream_file(&log_group, &log_stream, path, file_complete)
            .await
    })
}
