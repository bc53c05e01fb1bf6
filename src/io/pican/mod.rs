// src/io/pican/mod.rs
//
// PiCAN (SocketCAN hat) backend driven through the can-utils shell tools:
// the link is brought up with `ip link`, receive tails a long-lived
// candump child process, transmit spawns cansend per frame.

pub mod parser;

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::io::{CanBus, CanMessage, CanSpeed, IoError, TransmitResult};
use crate::signal::{format_can_id, format_payload};
use parser::parse_dump_line;

pub struct PiCanBus {
    dump_cmd: String,
    send_cmd: String,
    interface: Mutex<Option<String>>,
    child: tokio::sync::Mutex<Option<Child>>,
    stop_flag: Arc<AtomicBool>,
    tx: mpsc::Sender<CanMessage>,
}

impl PiCanBus {
    pub fn new(dump_cmd: &str, tx: mpsc::Sender<CanMessage>) -> Self {
        Self {
            dump_cmd: dump_cmd.to_string(),
            // The send utility lives next to the dump utility
            send_cmd: dump_cmd.replace("candump", "cansend"),
            interface: Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            stop_flag: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    /// Stop the dump child and take the link down. Safe to call when
    /// nothing is running.
    async fn shutdown_link(&self, interface: &str) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        let result = Command::new("sudo")
            .args(["/sbin/ip", "link", "set", interface, "down"])
            .status()
            .await;
        if let Err(e) = result {
            tlog!("[pican] Link down failed: {}", e);
        }
    }
}

#[async_trait]
impl CanBus for PiCanBus {
    fn is_open(&self) -> bool {
        self.interface
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    async fn open(&self, interface: &str, speed: CanSpeed) -> Result<(), IoError> {
        let device = format!("pican({})", interface);

        // Tear down any previous session and give the controller time to
        // settle before reconfiguring
        self.shutdown_link(interface).await;
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let bitrate = speed.bitrate().to_string();
        let link_up = Command::new("sudo")
            .args([
                "/sbin/ip", "link", "set", interface, "up", "type", "can", "bitrate", &bitrate,
            ])
            .status()
            .await;
        // The link may already be up; candump will fail below if it is not
        match link_up {
            Ok(status) if status.success() => {}
            Ok(status) => tlog!("[pican] Link up exited with {}", status),
            Err(e) => tlog!("[pican] Link up failed: {}", e),
        }

        let mut child = Command::new(&self.dump_cmd)
            .arg(interface)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| IoError::connection(&device, e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IoError::connection(&device, "no stdout from dump process"))?;

        self.stop_flag.store(false, Ordering::SeqCst);
        let stop_flag = self.stop_flag.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(msg) = parse_dump_line(&line) {
                            if tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        tlog!("[pican] Dump process ended");
                        break;
                    }
                    Err(e) => {
                        tlog!("[pican] Dump read error: {}", e);
                        break;
                    }
                }
            }
        });

        *self.child.lock().await = Some(child);
        if let Ok(mut guard) = self.interface.lock() {
            *guard = Some(interface.to_string());
        }

        tlog!(
            "[pican] Receiving from {} at {} bps via {}",
            interface,
            speed,
            self.dump_cmd
        );
        Ok(())
    }

    async fn send(&self, message: &CanMessage) -> TransmitResult {
        let interface = match self.interface.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(interface) => interface.clone(),
                None => return TransmitResult::error("bus not open".to_string()),
            },
            Err(_) => return TransmitResult::error("interface lock poisoned".to_string()),
        };

        // cansend takes `<iface> <id>#<data>`; the full 8 byte payload is
        // rendered so field offsets land where receivers expect them
        let frame_arg = format!(
            "{}#{}",
            format_can_id(message.can_id),
            format_payload(message.payload(), 8)
        );

        match Command::new(&self.send_cmd)
            .args([interface.as_str(), frame_arg.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(mut child) => {
                // Fire and forget; reap the child off the send path
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                TransmitResult::success()
            }
            Err(e) => TransmitResult::error(e.to_string()),
        }
    }

    async fn close(&self) {
        let interface = self
            .interface
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(interface) = interface {
            self.shutdown_link(&interface).await;
            tlog!("[pican] Closed {}", interface);
        }
    }
}
