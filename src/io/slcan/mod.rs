// src/io/slcan/mod.rs
//
// slcan (Serial Line CAN) adapter backend for CANable, Lawicel, and other
// USB-CAN adapters using the slcan ASCII protocol. The adapter UART runs
// at a fixed rate; the CAN bitrate is selected with the `S<n>` setup
// command before the channel is opened.
//
// Protocol reference: http://www.can232.com/docs/can232_v3.pdf

pub mod parser;

use async_trait::async_trait;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::io::{CanBus, CanMessage, CanSpeed, IdLength, IoError, TransmitResult};
use crate::signal::format_payload;
use parser::AsciiFrameBuffer;

/// Fixed adapter UART speed.
const COM_SPEED: u32 = 57_600;

type SharedPort = Arc<Mutex<Option<Box<dyn serialport::SerialPort>>>>;

pub struct SlcanBus {
    port: SharedPort,
    stop_flag: Arc<AtomicBool>,
    tx: mpsc::Sender<CanMessage>,
}

impl SlcanBus {
    pub fn new(tx: mpsc::Sender<CanMessage>) -> Self {
        Self {
            port: Arc::new(Mutex::new(None)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    /// Write one setup command while holding the port lock briefly.
    fn write_command(&self, command: &[u8]) -> Result<(), String> {
        let mut guard = self
            .port
            .lock()
            .map_err(|_| "port lock poisoned".to_string())?;
        match guard.as_mut() {
            Some(p) => p
                .write_all(command)
                .and_then(|_| p.flush())
                .map_err(|e| e.to_string()),
            None => Err("port not open".to_string()),
        }
    }
}

#[async_trait]
impl CanBus for SlcanBus {
    fn is_open(&self) -> bool {
        self.port
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    async fn open(&self, interface: &str, speed: CanSpeed) -> Result<(), IoError> {
        let device = format!("slcan({})", interface);

        {
            let guard = self
                .port
                .lock()
                .map_err(|_| IoError::configuration(format!("{} port lock poisoned", device)))?;
            if guard.is_some() {
                return Err(IoError::configuration(format!("{} already open", device)));
            }
        }

        let port = serialport::new(interface, COM_SPEED)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| IoError::connection(&device, e.to_string()))?;

        if let Ok(mut guard) = self.port.lock() {
            *guard = Some(port);
        }

        // Select the CAN bitrate, then open the channel
        let setup = format!("S{}\r", speed.slcan_index());
        self.write_command(setup.as_bytes())
            .map_err(|e| IoError::protocol(&device, format!("set bitrate: {}", e)))?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.write_command(b"O\r")
            .map_err(|e| IoError::protocol(&device, format!("open channel: {}", e)))?;

        self.stop_flag.store(false, Ordering::SeqCst);
        let stop_flag = self.stop_flag.clone();
        let port_shared = self.port.clone();
        let tx = self.tx.clone();

        // Read loop (blocking)
        tokio::task::spawn_blocking(move || {
            let mut framer = AsciiFrameBuffer::new();
            let mut read_buf = [0u8; 256];

            while !stop_flag.load(Ordering::SeqCst) {
                let read_result = {
                    let mut guard = match port_shared.lock() {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                    match guard.as_mut() {
                        Some(port) => port.read(&mut read_buf),
                        // Closed under us
                        None => return,
                    }
                };

                match read_result {
                    Ok(n) if n > 0 => {
                        for msg in framer.push_bytes(&read_buf[..n]) {
                            if tx.blocking_send(msg).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(_) => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Timeout - continue
                    }
                    Err(e) => {
                        tlog!("[slcan] {}", IoError::read(&device, e.to_string()));
                        return;
                    }
                }
            }
        });

        tlog!("[slcan] Connected to {} ({} bps CAN)", interface, speed);
        Ok(())
    }

    async fn send(&self, message: &CanMessage) -> TransmitResult {
        let (prefix, id_text) = match message.id_length {
            IdLength::Bit11 => ('t', format!("{:03X}", message.can_id)),
            IdLength::Bit29 => ('T', format!("{:08X}", message.can_id)),
        };
        let frame = format!(
            "{}{}{}{}\r",
            prefix,
            id_text,
            message.data_length,
            format_payload(message.payload(), message.data_length)
        );

        let port = self.port.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = port.lock().map_err(|_| "port lock poisoned".to_string())?;
            match guard.as_mut() {
                Some(p) => p
                    .write_all(frame.as_bytes())
                    .and_then(|_| p.flush())
                    .map_err(|e| e.to_string()),
                None => Err("port not open".to_string()),
            }
        })
        .await;

        match result {
            Ok(Ok(())) => TransmitResult::success(),
            Ok(Err(e)) => TransmitResult::error(e),
            Err(e) => TransmitResult::error(e.to_string()),
        }
    }

    async fn close(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let port = self.port.clone();
        let was_open = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = port.lock() {
                if guard.is_some() {
                    if let Some(p) = guard.as_mut() {
                        let _ = p.write_all(b"C\r");
                        let _ = p.flush();
                    }
                    *guard = None;
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        if was_open {
            tlog!("[slcan] Closed");
        }
    }
}
