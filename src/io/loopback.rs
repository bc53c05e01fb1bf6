// src/io/loopback.rs
//
// In-process bus for tests and dry runs without CAN hardware. Sends are
// recorded; inbound traffic is injected as dump-format lines.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::io::pican::parser::parse_dump_line;
use crate::io::{CanBus, CanMessage, CanSpeed, IoError, TransmitResult};
use crate::signal::{format_can_id, format_payload};

pub struct LoopbackBus {
    open: AtomicBool,
    sent: Mutex<Vec<CanMessage>>,
    tx: mpsc::Sender<CanMessage>,
}

impl LoopbackBus {
    pub fn new(tx: mpsc::Sender<CanMessage>) -> Self {
        Self {
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            tx,
        }
    }

    /// Inject one dump-format line as if it arrived from hardware.
    pub async fn simulate_rx(&self, line: &str) {
        if let Some(msg) = parse_dump_line(line) {
            let _ = self.tx.send(msg).await;
        }
    }

    /// Messages sent so far, oldest first.
    pub fn sent_messages(&self) -> Vec<CanMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CanBus for LoopbackBus {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open(&self, interface: &str, speed: CanSpeed) -> Result<(), IoError> {
        self.open.store(true, Ordering::SeqCst);
        tlog!("[loopback] Open {} at {} bps", interface, speed);
        Ok(())
    }

    async fn send(&self, message: &CanMessage) -> TransmitResult {
        tlog!(
            "[loopback] Sending {}#{}",
            format_can_id(message.can_id),
            format_payload(message.payload(), message.data_length)
        );
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.clone());
        }
        TransmitResult::success()
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        tlog!("[loopback] Closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_rx_reaches_the_receive_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let bus = LoopbackBus::new(tx);
        bus.simulate_rx("can0 123 [2] AA BB").await;
        bus.simulate_rx("this is noise").await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.can_id, 0x123);
        assert_eq!(msg.data, vec![0xAA, 0xBB]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sends_are_recorded() {
        let (tx, _rx) = mpsc::channel(8);
        let bus = LoopbackBus::new(tx);
        assert!(!bus.is_open());
        bus.open("can0", CanSpeed::Kbit250).await.unwrap();
        assert!(bus.is_open());

        let msg = CanMessage {
            can_id: 0x200,
            id_length: crate::io::IdLength::Bit11,
            data: vec![0x01],
            data_length: 1,
            timestamp_us: 0,
        };
        let result = bus.send(&msg).await;
        assert!(result.success);
        assert_eq!(bus.sent_messages().len(), 1);
        assert_eq!(bus.sent_messages()[0].can_id, 0x200);

        bus.close().await;
        assert!(!bus.is_open());
    }
}
