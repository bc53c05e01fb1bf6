// src/broadcast.rs
//
// Virtual channel broadcast scheduler. Folds channel values into per-id
// CAN aggregates and rebroadcasts each frame on its own cadence, with a
// watchdog that zeroes channels that stop updating.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::io::{now_us, CanBus, CanMessage, IdLength};
use crate::signal::{encode_value, ChannelMapping, ChannelStatus, SignalError};

// ============================================================================
// Constants
// ============================================================================

/// Delay before the first broadcast tick.
const BROADCAST_WARMUP: Duration = Duration::from_millis(500);
/// Cadence of the broadcast tick.
const BROADCAST_PERIOD: Duration = Duration::from_millis(100);
/// Delay before the first watchdog pass.
const WATCHDOG_WARMUP: Duration = Duration::from_millis(3000);
/// A channel that has not updated within this window is forced to zero.
/// Also the watchdog cadence.
const CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);
/// Floor for per-frame rebroadcast intervals.
const MIN_BROADCAST_INTERVAL_MS: u64 = 100;

// ============================================================================
// Types
// ============================================================================

/// A mapping joined with the latest status seen for it.
struct ChannelInstance {
    mapping: ChannelMapping,
    status: Option<ChannelStatus>,
}

/// Accumulation buffer for all channels sharing one CAN id.
#[derive(Clone)]
struct CanAggregate {
    packed_data: u64,
    data_length: u8,
    id_length: IdLength,
    next_broadcast: Instant,
}

/// Clears the tick-in-progress flag on every exit path.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One start/stop generation of the timer tasks. The cancel flag belongs
/// to this generation alone; a later start never touches it.
struct TimerTasks {
    cancel_flag: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

/// Broadcast scheduler. Cheap to clone; clones share all state, which is
/// how the two timer tasks and the ingestion side see one instance.
#[derive(Clone)]
pub struct VirtualChannelBroadcast {
    channels: Arc<Mutex<HashMap<u32, ChannelInstance>>>,
    aggregates: Arc<Mutex<HashMap<u32, CanAggregate>>>,
    bus: Arc<Mutex<Option<Arc<dyn CanBus>>>>,
    tick_running: Arc<AtomicBool>,
    tasks: Arc<Mutex<Option<TimerTasks>>>,
}

impl Default for VirtualChannelBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualChannelBroadcast {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            aggregates: Arc::new(Mutex::new(HashMap::new())),
            bus: Arc::new(Mutex::new(None)),
            tick_running: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(Mutex::new(None)),
        }
    }

    /// Attach or detach the transport. With no transport attached the
    /// broadcast tick is a no-op.
    pub fn set_can_bus(&self, bus: Option<Arc<dyn CanBus>>) {
        if let Ok(mut guard) = self.bus.lock() {
            *guard = bus;
        }
    }

    /// Replace the mapping table. Status carries over for mapping ids that
    /// survive the swap; everything else is dropped, status included.
    pub fn set_virtual_channel_mappings(&self, mappings: &[ChannelMapping]) {
        if let Ok(mut channels) = self.channels.lock() {
            let mut previous = std::mem::take(&mut *channels);
            for mapping in mappings {
                let instance = match previous.remove(&mapping.id) {
                    Some(mut existing) => {
                        existing.mapping = mapping.clone();
                        existing
                    }
                    None => ChannelInstance {
                        mapping: mapping.clone(),
                        status: None,
                    },
                };
                channels.insert(mapping.id, instance);
            }
        }
    }

    /// Record new channel values and fold them into their aggregates,
    /// marking each touched aggregate immediately due. Statuses with no
    /// matching mapping are ignored. An encode failure aborts the batch;
    /// values folded before the failure stay applied.
    pub fn update_values(&self, statuses: &[ChannelStatus]) -> Result<(), SignalError> {
        let affected: Vec<(ChannelMapping, f32)> = match self.channels.lock() {
            Ok(mut channels) => statuses
                .iter()
                .filter_map(|status| {
                    channels.get_mut(&status.channel_id).map(|instance| {
                        instance.status = Some(status.clone());
                        (instance.mapping.clone(), status.value)
                    })
                })
                .collect(),
            Err(_) => return Ok(()),
        };

        if let Ok(mut aggregates) = self.aggregates.lock() {
            for (mapping, value) in affected {
                let aggregate =
                    aggregates
                        .entry(mapping.can_id)
                        .or_insert_with(|| CanAggregate {
                            packed_data: 0,
                            data_length: 0,
                            id_length: IdLength::from_id(mapping.can_id),
                            next_broadcast: Instant::now(),
                        });
                aggregate.packed_data = encode_value(aggregate.packed_data, value, &mapping)?;
                let field_end = mapping.offset + mapping.length;
                if field_end > aggregate.data_length {
                    aggregate.data_length = field_end;
                }
                aggregate.next_broadcast = Instant::now();
            }
        }
        Ok(())
    }

    /// Start the broadcast and watchdog timers. Starting twice without a
    /// stop in between is a programming error and fails loudly.
    pub fn start(&self) -> Result<(), SignalError> {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(_) => return Err(SignalError::DuplicateStart),
        };
        if tasks.is_some() {
            return Err(SignalError::DuplicateStart);
        }

        // A fresh flag per start; a loop from a stopped generation that is
        // still parked in a sleep only ever sees its own flag
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(2);

        let broadcast = self.clone();
        let broadcast_cancel = cancel_flag.clone();
        handles.push(tokio::spawn(async move {
            broadcast.run_broadcast_loop(broadcast_cancel).await;
        }));
        let watchdog = self.clone();
        let watchdog_cancel = cancel_flag.clone();
        handles.push(tokio::spawn(async move {
            watchdog.run_watchdog_loop(watchdog_cancel).await;
        }));
        *tasks = Some(TimerTasks {
            cancel_flag,
            handles,
        });
        tlog!("[broadcast] Started");
        Ok(())
    }

    /// Stop both timers. Idempotent; does not wait for an in-flight tick.
    pub fn stop(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(running) = tasks.take() {
                running.cancel_flag.store(true, Ordering::SeqCst);
                // Dropped, not awaited; the loops see the flag at their
                // next wake and exit
                drop(running.handles);
                tlog!("[broadcast] Stopped");
            }
        }
    }

    async fn run_broadcast_loop(self, cancel_flag: Arc<AtomicBool>) {
        tokio::time::sleep(BROADCAST_WARMUP).await;
        if cancel_flag.load(Ordering::SeqCst) {
            return;
        }
        self.broadcast_tick().await;

        let mut interval_timer = tokio::time::interval(BROADCAST_PERIOD);
        interval_timer.tick().await; // Skip the first tick which fires immediately
        loop {
            interval_timer.tick().await;
            if cancel_flag.load(Ordering::SeqCst) {
                break;
            }
            self.broadcast_tick().await;
        }
    }

    async fn run_watchdog_loop(self, cancel_flag: Arc<AtomicBool>) {
        tokio::time::sleep(WATCHDOG_WARMUP).await;
        if cancel_flag.load(Ordering::SeqCst) {
            return;
        }
        self.watchdog_pass();

        let mut interval_timer = tokio::time::interval(CHANNEL_TIMEOUT);
        interval_timer.tick().await; // Skip the first tick which fires immediately
        loop {
            interval_timer.tick().await;
            if cancel_flag.load(Ordering::SeqCst) {
                break;
            }
            self.watchdog_pass();
        }
    }

    /// One pass of the broadcast timer: send every due aggregate, then
    /// reschedule each from its contributing mappings.
    async fn broadcast_tick(&self) {
        // A slow tick is skipped, not queued behind itself
        if self
            .tick_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tlog!("[broadcast] Tick still running, skipping");
            return;
        }
        let _guard = TickGuard(&self.tick_running);

        let bus = match self.bus.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        let bus = match bus {
            Some(bus) => bus,
            None => return,
        };

        let now = Instant::now();
        let due: Vec<(u32, CanAggregate)> = match self.aggregates.lock() {
            Ok(aggregates) => aggregates
                .iter()
                .filter(|(_, aggregate)| aggregate.next_broadcast <= now)
                .map(|(can_id, aggregate)| (*can_id, aggregate.clone()))
                .collect(),
            Err(_) => return,
        };
        if due.is_empty() {
            return;
        }

        // Send outside all locks
        for (can_id, aggregate) in &due {
            let length = aggregate.data_length.min(8) as usize;
            let message = CanMessage {
                can_id: *can_id,
                id_length: aggregate.id_length,
                data: aggregate.packed_data.to_le_bytes()[..length].to_vec(),
                data_length: length as u8,
                timestamp_us: now_us(),
            };
            let result = bus.send(&message).await;
            if !result.success {
                tlog!(
                    "[broadcast] Send failed for {:X}: {}",
                    can_id,
                    result.error.unwrap_or_default()
                );
            }
        }

        // Reschedule every frame that was due, whether or not its send worked
        for (can_id, _) in &due {
            self.reschedule(*can_id);
        }
    }

    /// Recompute an aggregate's shape and next broadcast time from the
    /// mappings currently contributing to it. The interval is the smallest
    /// requested frequency across contributors, floored at 100ms.
    fn reschedule(&self, can_id: u32) {
        let contributors: Vec<(u8, u64)> = match self.channels.lock() {
            Ok(channels) => channels
                .values()
                .filter(|instance| instance.mapping.can_id == can_id)
                .map(|instance| {
                    (
                        instance.mapping.offset + instance.mapping.length,
                        instance.mapping.virtual_frequency_ms,
                    )
                })
                .collect(),
            Err(_) => return,
        };
        if contributors.is_empty() {
            // Every contributor was remapped away; drop the frame rather
            // than leave it due forever
            if let Ok(mut aggregates) = self.aggregates.lock() {
                aggregates.remove(&can_id);
            }
            tlog!("[broadcast] No mappings left for {:X}, dropping frame", can_id);
            return;
        }

        let data_length = contributors.iter().map(|(end, _)| *end).max().unwrap_or(0);
        let min_frequency = contributors
            .iter()
            .map(|(_, freq)| *freq)
            .min()
            .unwrap_or(MIN_BROADCAST_INTERVAL_MS);
        let interval_ms = min_frequency.max(MIN_BROADCAST_INTERVAL_MS);

        if let Ok(mut aggregates) = self.aggregates.lock() {
            if let Some(aggregate) = aggregates.get_mut(&can_id) {
                aggregate.id_length = IdLength::from_id(can_id);
                aggregate.data_length = data_length;
                aggregate.next_broadcast = Instant::now() + Duration::from_millis(interval_ms);
            }
        }
    }

    /// One pass of the watchdog: any channel whose status is older than the
    /// timeout window is forced to zero and fed back through update_values,
    /// which rebroadcasts the owning aggregate.
    fn watchdog_pass(&self) {
        let now = now_us();
        let timeout_us = CHANNEL_TIMEOUT.as_micros() as u64;
        let stale: Vec<ChannelStatus> = match self.channels.lock() {
            Ok(mut channels) => channels
                .values_mut()
                .filter_map(|instance| match instance.status.as_mut() {
                    Some(status) if now.saturating_sub(status.timestamp_us) > timeout_us => {
                        // The zero is synthetic; the stale timestamp stays
                        status.value = 0.0;
                        tlog!(
                            "[broadcast] Channel {} timed out, forcing 0",
                            instance.mapping.channel_name
                        );
                        Some(status.clone())
                    }
                    _ => None,
                })
                .collect(),
            Err(_) => return,
        };

        if !stale.is_empty() {
            if let Err(e) = self.update_values(&stale) {
                tlog!("[broadcast] Timeout reset failed: {}", e);
            }
        }
    }

    #[cfg(test)]
    fn aggregate_snapshot(&self, can_id: u32) -> Option<CanAggregate> {
        self.aggregates
            .lock()
            .ok()
            .and_then(|aggregates| aggregates.get(&can_id).cloned())
    }

    #[cfg(test)]
    fn channel_status(&self, mapping_id: u32) -> Option<ChannelStatus> {
        self.channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(&mapping_id).and_then(|i| i.status.clone()))
    }

    #[cfg(test)]
    fn generation_cancel_flag(&self) -> Option<Arc<AtomicBool>> {
        self.tasks
            .lock()
            .ok()
            .and_then(|tasks| tasks.as_ref().map(|running| running.cancel_flag.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversions::Conversion;
    use crate::io::loopback::LoopbackBus;
    use crate::signal::SourceType;
    use tokio::sync::mpsc;

    fn mapping(id: u32, can_id: u32, offset: u8, frequency_ms: u64) -> ChannelMapping {
        ChannelMapping {
            id,
            can_id,
            offset,
            length: 1,
            source_type: SourceType::Unsigned,
            is_big_endian: true,
            formula_multiplier: 1.0,
            formula_divider: 0.0,
            formula_const: 0.0,
            conversion: Conversion::None,
            virtual_frequency_ms: frequency_ms,
            channel_name: format!("ch{}", id),
        }
    }

    fn status(channel_id: u32, value: f32) -> ChannelStatus {
        ChannelStatus {
            channel_id,
            value,
            timestamp_us: now_us(),
        }
    }

    fn loopback() -> (Arc<LoopbackBus>, mpsc::Receiver<CanMessage>) {
        let (tx, rx) = mpsc::channel(64);
        (Arc::new(LoopbackBus::new(tx)), rx)
    }

    #[test]
    fn test_update_values_folds_into_aggregate() {
        let broadcast = VirtualChannelBroadcast::new();
        broadcast.set_virtual_channel_mappings(&[
            mapping(1, 0x100, 0, 50),
            mapping(2, 0x100, 1, 200),
        ]);
        broadcast
            .update_values(&[status(1, 0x11 as f32), status(2, 0x22 as f32)])
            .unwrap();

        let aggregate = broadcast.aggregate_snapshot(0x100).unwrap();
        assert_eq!(aggregate.packed_data, 0x2211);
        assert_eq!(aggregate.data_length, 2);
        assert_eq!(aggregate.id_length, IdLength::Bit11);
        assert!(aggregate.next_broadcast <= Instant::now());
    }

    #[test]
    fn test_update_values_ignores_unknown_channels() {
        let broadcast = VirtualChannelBroadcast::new();
        broadcast.set_virtual_channel_mappings(&[mapping(1, 0x100, 0, 100)]);
        broadcast.update_values(&[status(99, 1.0)]).unwrap();
        assert!(broadcast.aggregate_snapshot(0x100).is_none());
    }

    #[test]
    fn test_update_values_surfaces_encode_failure() {
        let broadcast = VirtualChannelBroadcast::new();
        let mut bad = mapping(1, 0x100, 0, 100);
        bad.source_type = SourceType::SignMagnitude;
        broadcast.set_virtual_channel_mappings(&[bad]);
        assert_eq!(
            broadcast.update_values(&[status(1, 1.0)]),
            Err(SignalError::UnsupportedSourceType(SourceType::SignMagnitude))
        );
    }

    #[tokio::test]
    async fn test_tick_sends_due_aggregate_and_floors_interval() {
        let broadcast = VirtualChannelBroadcast::new();
        let (bus, _rx) = loopback();
        broadcast.set_can_bus(Some(bus.clone()));
        broadcast.set_virtual_channel_mappings(&[
            mapping(1, 0x100, 0, 50),
            mapping(2, 0x100, 1, 200),
        ]);
        broadcast
            .update_values(&[status(1, 0x11 as f32), status(2, 0x22 as f32)])
            .unwrap();

        let before = Instant::now();
        broadcast.broadcast_tick().await;

        let sent = bus.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].can_id, 0x100);
        assert_eq!(sent[0].data, vec![0x11, 0x22]);
        assert_eq!(sent[0].data_length, 2);

        // 50ms requested, floored to the 100ms minimum; 200ms does not govern
        let aggregate = broadcast.aggregate_snapshot(0x100).unwrap();
        let delay = aggregate.next_broadcast.duration_since(before);
        assert!(
            delay >= Duration::from_millis(100) && delay < Duration::from_millis(200),
            "unexpected reschedule delay {:?}",
            delay
        );

        // Nothing is due now, so a second tick sends nothing
        broadcast.broadcast_tick().await;
        assert_eq!(bus.sent_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_without_bus_leaves_aggregate_due() {
        let broadcast = VirtualChannelBroadcast::new();
        broadcast.set_virtual_channel_mappings(&[mapping(1, 0x100, 0, 100)]);
        broadcast.update_values(&[status(1, 1.0)]).unwrap();

        broadcast.broadcast_tick().await;
        let aggregate = broadcast.aggregate_snapshot(0x100).unwrap();
        assert!(aggregate.next_broadcast <= Instant::now());
    }

    #[tokio::test]
    async fn test_start_twice_fails_until_stopped() {
        let broadcast = VirtualChannelBroadcast::new();
        broadcast.start().unwrap();
        assert_eq!(broadcast.start(), Err(SignalError::DuplicateStart));
        broadcast.stop();
        broadcast.stop();
        broadcast.start().unwrap();
        broadcast.stop();
    }

    #[tokio::test]
    async fn test_stop_cancels_only_its_own_generation() {
        let broadcast = VirtualChannelBroadcast::new();
        broadcast.start().unwrap();
        let first = broadcast.generation_cancel_flag().unwrap();
        broadcast.stop();
        broadcast.start().unwrap();
        let second = broadcast.generation_cancel_flag().unwrap();

        // The stopped generation stays cancelled; the replacement runs
        // under its own flag
        assert!(first.load(Ordering::SeqCst));
        assert!(!second.load(Ordering::SeqCst));
        assert!(!Arc::ptr_eq(&first, &second));
        broadcast.stop();
    }

    #[tokio::test]
    async fn test_restart_during_warmup_leaves_one_broadcast_loop() {
        let broadcast = VirtualChannelBroadcast::new();
        let (bus, _rx) = loopback();
        broadcast.set_can_bus(Some(bus.clone()));
        broadcast.set_virtual_channel_mappings(&[mapping(1, 0x100, 0, 100)]);

        // Stop the first generation while it is still in its warmup sleep,
        // then start a replacement
        broadcast.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        broadcast.stop();
        broadcast.start().unwrap();

        // Wait out the replacement's warmup, then keep the frame
        // permanently due while a second of tick cadence elapses. One
        // live 100ms loop sends at most once per tick; a first-generation
        // loop waking back up would double the rate.
        tokio::time::sleep(BROADCAST_WARMUP + Duration::from_millis(50)).await;
        let baseline = bus.sent_messages().len();
        let window = Instant::now();
        for _ in 0..100 {
            broadcast.update_values(&[status(1, 1.0)]).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        broadcast.stop();

        let sends = bus.sent_messages().len() - baseline;
        let ceiling = window.elapsed().as_millis() as usize / 100 + 2;
        assert!(
            sends <= ceiling,
            "two broadcast loops alive: {} sends, ceiling {}",
            sends,
            ceiling
        );
        assert!(sends >= 2, "broadcast loop never ran: {} sends", sends);
    }

    #[tokio::test]
    async fn test_orphaned_aggregate_is_dropped_after_final_send() {
        let broadcast = VirtualChannelBroadcast::new();
        let (bus, _rx) = loopback();
        broadcast.set_can_bus(Some(bus.clone()));
        broadcast.set_virtual_channel_mappings(&[mapping(1, 0x100, 0, 100)]);
        broadcast.update_values(&[status(1, 1.0)]).unwrap();

        // All contributors remapped away while the frame is still due
        broadcast.set_virtual_channel_mappings(&[]);
        broadcast.broadcast_tick().await;
        assert_eq!(bus.sent_messages().len(), 1);
        assert!(broadcast.aggregate_snapshot(0x100).is_none());

        // Nothing left to resend
        broadcast.broadcast_tick().await;
        assert_eq!(bus.sent_messages().len(), 1);
    }

    #[test]
    fn test_remap_keeps_status_for_surviving_ids_only() {
        let broadcast = VirtualChannelBroadcast::new();
        broadcast.set_virtual_channel_mappings(&[mapping(1, 0x100, 0, 100)]);
        broadcast.update_values(&[status(1, 5.0)]).unwrap();
        assert_eq!(broadcast.channel_status(1).unwrap().value, 5.0);

        // Same id with a new definition keeps the in-flight status
        broadcast.set_virtual_channel_mappings(&[mapping(1, 0x200, 2, 100)]);
        assert_eq!(broadcast.channel_status(1).unwrap().value, 5.0);

        // Removing the id drops its status; re-adding does not resurrect it
        broadcast.set_virtual_channel_mappings(&[]);
        broadcast.set_virtual_channel_mappings(&[mapping(1, 0x300, 1, 100)]);
        assert!(broadcast.channel_status(1).is_none());
    }

    #[test]
    fn test_watchdog_zeroes_stale_channels_without_touching_timestamp() {
        let broadcast = VirtualChannelBroadcast::new();
        broadcast.set_virtual_channel_mappings(&[
            mapping(1, 0x100, 0, 100),
            mapping(2, 0x100, 1, 100),
        ]);

        let old_timestamp = now_us().saturating_sub(11_000_000);
        broadcast
            .update_values(&[
                ChannelStatus {
                    channel_id: 1,
                    value: 42.0,
                    timestamp_us: old_timestamp,
                },
                status(2, 7.0),
            ])
            .unwrap();

        broadcast.watchdog_pass();

        let stale = broadcast.channel_status(1).unwrap();
        assert_eq!(stale.value, 0.0);
        assert_eq!(stale.timestamp_us, old_timestamp);

        // The fresh channel is untouched
        assert_eq!(broadcast.channel_status(2).unwrap().value, 7.0);

        // The zero was folded back into the aggregate and marked due
        let aggregate = broadcast.aggregate_snapshot(0x100).unwrap();
        assert_eq!(aggregate.packed_data, 0x0700);
        assert!(aggregate.next_broadcast <= Instant::now());
    }

    #[test]
    fn test_channels_with_no_status_never_time_out() {
        let broadcast = VirtualChannelBroadcast::new();
        broadcast.set_virtual_channel_mappings(&[mapping(1, 0x100, 0, 100)]);
        broadcast.watchdog_pass();
        assert!(broadcast.channel_status(1).is_none());
    }
}
