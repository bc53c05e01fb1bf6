// src/io/replay.rs
//
// Dump file replay. Feeds recorded candump lines into the receive path at
// a fixed pace, optionally looping, for bench runs without a vehicle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::io::pican::parser::parse_dump_line;
use crate::io::CanMessage;

pub const DEFAULT_MESSAGE_SPACING_MS: u64 = 100;

/// Replay a candump capture into the receive channel. Unparseable lines
/// are skipped; the loop exits when the stop flag is raised, the channel
/// closes, or the file ends with `repeat` off.
pub async fn run_replay(
    path: &str,
    spacing_ms: u64,
    repeat: bool,
    stop_flag: Arc<AtomicBool>,
    tx: mpsc::Sender<CanMessage>,
) {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            tlog!("[replay] Failed to read {}: {}", path, e);
            return;
        }
    };
    tlog!(
        "[replay] Replaying {} ({} lines, {} ms spacing)",
        path,
        content.lines().count(),
        spacing_ms
    );

    loop {
        for line in content.lines() {
            if stop_flag.load(Ordering::SeqCst) {
                return;
            }
            if let Some(msg) = parse_dump_line(line) {
                if tx.send(msg).await.is_err() {
                    return;
                }
            }
            if spacing_ms > 0 {
                tokio::time::sleep(Duration::from_millis(spacing_ms)).await;
            }
        }
        if !repeat || stop_flag.load(Ordering::SeqCst) {
            break;
        }
    }
    tlog!("[replay] Finished {}", path);
}
