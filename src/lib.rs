#[macro_use]
mod logging;

pub mod broadcast;
pub mod channel_cache;
pub mod conversions;
pub mod io;
pub mod settings;
pub mod signal;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use broadcast::VirtualChannelBroadcast;
use channel_cache::ChannelStateCache;
use io::CanMessage;
use settings::AppSettings;
use signal::{decode_value, ChannelMapping, ChannelStatus};

/// Receive channel depth. Generous; backends block rather than drop.
const RECEIVE_QUEUE_DEPTH: usize = 256;

/// Decode one received frame against every mapping listening on its id.
/// A mapping that cannot decode is logged and skipped; the rest of the
/// frame still goes through.
fn decode_frame(message: &CanMessage, mappings: &[ChannelMapping]) -> Vec<ChannelStatus> {
    let payload = message.payload();
    let mut statuses = Vec::new();
    for mapping in mappings.iter().filter(|m| m.can_id == message.can_id) {
        match decode_value(payload, mapping) {
            Ok(value) => statuses.push(ChannelStatus {
                channel_id: mapping.id,
                value,
                timestamp_us: message.timestamp_us,
            }),
            Err(e) => tlog!("[run] Decode failed for channel {}: {}", mapping.id, e),
        }
    }
    statuses
}

#[tokio::main]
pub async fn run() {
    let settings = match settings::load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            tlog!("[run] Falling back to default settings: {}", e);
            AppSettings::default()
        }
    };

    if settings.log_to_file {
        if let Err(e) = logging::init_file_logging(Path::new(&settings.log_dir)) {
            tlog!("[run] File logging unavailable: {}", e);
        }
    }
    tlog!("[run] chicane {} starting", env!("CARGO_PKG_VERSION"));

    let mappings = match settings::load_mappings(&settings.mappings_file) {
        Ok(mappings) => mappings,
        Err(e) => {
            tlog!("[run] No mappings loaded: {}", e);
            Vec::new()
        }
    };

    let (receive_tx, mut receive_rx) = mpsc::channel::<CanMessage>(RECEIVE_QUEUE_DEPTH);
    let (bus, interface) = io::create_bus(&settings, receive_tx.clone());

    let speed = match io::parse_can_speed(&settings.can_bitrate) {
        Ok(speed) => speed,
        Err(e) => {
            tlog!("[run] {}", e);
            return;
        }
    };
    if let Err(e) = bus.open(&interface, speed).await {
        tlog!("[run] Failed to open {}: {}", interface, e);
        return;
    }

    let cache = Arc::new(ChannelStateCache::new());
    let scheduler = VirtualChannelBroadcast::new();
    scheduler.set_can_bus(Some(bus.clone()));
    scheduler.set_virtual_channel_mappings(&mappings);
    if let Err(e) = scheduler.start() {
        tlog!("[run] Scheduler failed to start: {}", e);
    }

    // Optional replay of a recorded dump into the receive path
    let replay_stop = Arc::new(AtomicBool::new(false));
    if let Some(replay_file) = settings.replay_file.clone() {
        let tx = receive_tx.clone();
        let stop = replay_stop.clone();
        let spacing = settings.replay_spacing_ms;
        let repeat = settings.replay_repeat;
        tokio::spawn(async move {
            io::replay::run_replay(&replay_file, spacing, repeat, stop, tx).await;
        });
    }

    // Ingestion: decode every received frame, track changes, refresh the
    // scheduler with the values that actually moved
    let ingest_cache = cache.clone();
    let ingest_scheduler = scheduler.clone();
    let ingest = tokio::spawn(async move {
        while let Some(message) = receive_rx.recv().await {
            let statuses = decode_frame(&message, &mappings);
            if statuses.is_empty() {
                continue;
            }
            ingest_cache.update_channel_values(&statuses);
            let changed = ingest_cache.claim_dirty_channels();
            if changed.is_empty() {
                continue;
            }
            if let Err(e) = ingest_scheduler.update_values(&changed) {
                tlog!("[run] Rebroadcast update failed: {}", e);
            }
        }
    });

    tlog!("[run] Listening on {}", interface);
    if let Err(e) = tokio::signal::ctrl_c().await {
        tlog!("[run] Signal wait failed: {}", e);
    }
    tlog!("[run] Shutting down");

    replay_stop.store(true, Ordering::SeqCst);
    scheduler.stop();
    bus.close().await;
    ingest.abort();
    logging::stop_file_logging();
}
