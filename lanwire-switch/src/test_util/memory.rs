//! In-memory taps, bridges and publishers.

use crate::bridge::{self, Bridger};
use crate::config::BridgeConfig;
use crate::device::DeviceFactory;
use crate::publish::{Fields, Publisher};
use crate::tap::{self, TapError, Taper};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

/// Tap backed by channels.
///
/// [`MemoryTap::inject`] makes a frame readable as if the host sent it;
/// frames the switch writes are collected by [`MemoryTap::recv_written`].
pub struct MemoryTap {
    name: String,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written_tx: mpsc::UnboundedSender<Vec<u8>>,
    written_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
}

impl MemoryTap {
    pub fn new(name: &str) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            written_tx,
            written_rx: AsyncMutex::new(written_rx),
            closed,
        }
    }

    pub fn inject(&self, frame: &[u8]) {
        let _ = self.inbound_tx.send(frame.to_vec());
    }

    /// Next frame written to the tap, if one arrives within `timeout`.
    pub async fn recv_written(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut rx = self.written_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

async fn closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

#[async_trait]
impl Taper for MemoryTap {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_frame(&self, buf: &mut [u8]) -> tap::Result<usize> {
        let mut shutdown = self.closed.subscribe();
        if *shutdown.borrow() {
            return Err(TapError::Closed(self.name.clone()));
        }
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = closed(&mut shutdown) => Err(TapError::Closed(self.name.clone())),
            frame = rx.recv() => match frame {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                None => Err(TapError::Closed(self.name.clone())),
            },
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> tap::Result<()> {
        if self.is_closed() {
            return Err(TapError::Closed(self.name.clone()));
        }
        let _ = self.written_tx.send(frame.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Bridge that only records what was asked of it.
#[derive(Default)]
pub struct MemoryBridge {
    name: String,
    address: Mutex<Option<String>>,
    slaves: Mutex<BTreeSet<String>>,
    opened: AtomicBool,
    stp: AtomicBool,
    forward_delay: AtomicU32,
}

impl MemoryBridge {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> Option<String> {
        self.address.lock().unwrap().clone()
    }

    pub fn stp(&self) -> bool {
        self.stp.load(Ordering::SeqCst)
    }

    pub fn forward_delay(&self) -> u32 {
        self.forward_delay.load(Ordering::SeqCst)
    }
}

impl Bridger for MemoryBridge {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, address: &str) -> bridge::Result<()> {
        self.opened.store(true, Ordering::SeqCst);
        if !address.is_empty() {
            *self.address.lock().unwrap() = Some(address.to_string());
        }
        Ok(())
    }

    fn close(&self) -> bridge::Result<()> {
        self.opened.store(false, Ordering::SeqCst);
        self.address.lock().unwrap().take();
        Ok(())
    }

    fn add_slave(&self, name: &str) -> bridge::Result<()> {
        self.slaves.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    fn del_slave(&self, name: &str) -> bridge::Result<()> {
        self.slaves.lock().unwrap().remove(name);
        Ok(())
    }

    fn set_stp(&self, enabled: bool) -> bridge::Result<()> {
        self.stp.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn set_forward_delay(&self, seconds: u32) -> bridge::Result<()> {
        self.forward_delay.store(seconds, Ordering::SeqCst);
        Ok(())
    }

    fn slaves(&self) -> Vec<String> {
        self.slaves.lock().unwrap().iter().cloned().collect()
    }
}

/// Device factory handing out [`MemoryTap`]s and [`MemoryBridge`]s.
#[derive(Default)]
pub struct MemoryDevices {
    taps: Mutex<Vec<Arc<MemoryTap>>>,
    bridges: Mutex<HashMap<String, Arc<MemoryBridge>>>,
    next: AtomicUsize,
}

impl MemoryDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tap(&self, name: &str) -> Option<Arc<MemoryTap>> {
        self.taps
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    /// Every tap created so far, in creation order.
    pub fn taps(&self) -> Vec<Arc<MemoryTap>> {
        self.taps.lock().unwrap().clone()
    }

    pub fn bridge_named(&self, name: &str) -> Option<Arc<MemoryBridge>> {
        self.bridges.lock().unwrap().get(name).cloned()
    }
}

impl DeviceFactory for MemoryDevices {
    fn bridge(&self, config: &BridgeConfig) -> Arc<dyn Bridger> {
        self.bridges
            .lock()
            .unwrap()
            .entry(config.name.clone())
            .or_insert_with(|| Arc::new(MemoryBridge::new(&config.name)))
            .clone()
    }

    fn create_tap(&self, name: &str) -> tap::Result<Arc<dyn Taper>> {
        let name = if name.is_empty() {
            format!("tap{}", self.next.fetch_add(1, Ordering::SeqCst))
        } else {
            name.to_string()
        };
        let tap = Arc::new(MemoryTap::new(&name));
        self.taps.lock().unwrap().push(tap.clone());
        Ok(tap)
    }
}

/// Publisher keeping every record.
#[derive(Default)]
pub struct RecordingPublisher {
    records: Mutex<Vec<(String, Fields)>>,
}

impl RecordingPublisher {
    pub fn records(&self) -> Vec<(String, Fields)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    fn publish(&self, key: &str, fields: Fields) {
        self.records.lock().unwrap().push((key.to_string(), fields));
    }
}
