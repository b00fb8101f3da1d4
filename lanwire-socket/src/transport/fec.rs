//! Datagrams with forward error correction.
//!
//! Frames are grouped into sets of `data_shards`. After the last frame of a
//! group the sender emits one parity shard, the XOR of every frame in the
//! group, so the receiver can rebuild a single lost frame per group.
//!
//! ```text
//! +------+-------+-----------+----------+---------+
//! | kind | index | group u32 | len u16  | payload |
//! +------+-------+-----------+----------+---------+
//! ```
//!
//! For parity shards `len` is the XOR of all frame lengths in the group.

use super::udp::{DatagramRecv, DatagramSend};
use super::{FrameReader, FrameWriter, Result, TransportError, open, seal};
use crate::crypt::BlockCrypt;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const SHARD_DATA: u8 = 0;
const SHARD_PARITY: u8 = 1;
const HEADER_LEN: usize = 8;

/// Groups remembered by the decoder.
const MAX_GROUPS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecConfig {
    /// Data shards per parity shard.
    #[serde(default = "default_data_shards")]
    pub data_shards: u8,
}

fn default_data_shards() -> u8 {
    4
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            data_shards: default_data_shards(),
        }
    }
}

fn xor_into(acc: &mut Vec<u8>, data: &[u8]) {
    if acc.len() < data.len() {
        acc.resize(data.len(), 0);
    }
    for (a, b) in acc.iter_mut().zip(data) {
        *a ^= b;
    }
}

fn shard(kind: u8, index: u8, group: u32, len: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind);
    out.push(index);
    out.extend_from_slice(&group.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Turns payloads into data shards plus a parity shard per group.
pub struct FecEncoder {
    shards: u8,
    group: u32,
    index: u8,
    parity: Vec<u8>,
    parity_len: u16,
}

impl FecEncoder {
    pub fn new(config: FecConfig) -> Self {
        Self {
            shards: config.data_shards.max(1),
            group: 0,
            index: 0,
            parity: Vec::new(),
            parity_len: 0,
        }
    }

    /// Datagrams to send for `payload`, two when a group completes.
    pub fn encode(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        let len = payload.len() as u16;
        let mut out = vec![shard(SHARD_DATA, self.index, self.group, len, payload)];

        xor_into(&mut self.parity, payload);
        self.parity_len ^= len;
        self.index += 1;

        if self.index == self.shards {
            out.push(shard(
                SHARD_PARITY,
                self.index,
                self.group,
                self.parity_len,
                &self.parity,
            ));
            self.group = self.group.wrapping_add(1);
            self.index = 0;
            self.parity.clear();
            self.parity_len = 0;
        }
        out
    }
}

struct Group {
    data: Vec<Option<Vec<u8>>>,
    parity: Option<(u16, Vec<u8>)>,
}

impl Group {
    fn new(shards: u8) -> Self {
        Self {
            data: vec![None; shards as usize],
            parity: None,
        }
    }

    /// Rebuild the one missing data shard, if exactly one is missing.
    fn recover(&mut self) -> Option<Vec<u8>> {
        let (len, parity) = self.parity.as_ref()?;
        let mut missing = self.data.iter().enumerate().filter(|(_, d)| d.is_none());
        let (index, _) = missing.next()?;
        if missing.next().is_some() {
            return None;
        }

        let mut bytes = parity.clone();
        let mut len = *len;
        for d in self.data.iter().flatten() {
            xor_into(&mut bytes, d);
            len ^= d.len() as u16;
        }
        let len = len as usize;
        if len > bytes.len() {
            return None;
        }
        bytes.truncate(len);
        self.data[index] = Some(bytes.clone());
        Some(bytes)
    }
}

/// Reassembles payloads from shards, rebuilding lost ones where possible.
pub struct FecDecoder {
    shards: u8,
    groups: HashMap<u32, Group>,
    order: VecDeque<u32>,
}

impl FecDecoder {
    pub fn new(config: FecConfig) -> Self {
        Self {
            shards: config.data_shards.max(1),
            groups: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Payloads made available by `datagram`, in arrival order.
    pub fn decode(&mut self, datagram: &[u8]) -> Result<Vec<Vec<u8>>> {
        if datagram.len() < HEADER_LEN {
            return Err(TransportError::Framing(format!(
                "fec shard of {} bytes",
                datagram.len()
            )));
        }
        let kind = datagram[0];
        let index = datagram[1];
        let group = u32::from_be_bytes([datagram[2], datagram[3], datagram[4], datagram[5]]);
        let len = u16::from_be_bytes([datagram[6], datagram[7]]);
        let payload = &datagram[HEADER_LEN..];

        match kind {
            SHARD_DATA if index < self.shards => {
                if payload.len() != len as usize {
                    return Err(TransportError::Framing(format!(
                        "fec shard length {} != {}",
                        payload.len(),
                        len
                    )));
                }
            }
            SHARD_PARITY => {}
            _ => {
                return Err(TransportError::Framing(format!(
                    "fec shard kind {kind} index {index}"
                )));
            }
        }

        let shards = self.shards;
        if !self.groups.contains_key(&group) {
            self.groups.insert(group, Group::new(shards));
            self.order.push_back(group);
            while self.order.len() > MAX_GROUPS {
                if let Some(old) = self.order.pop_front() {
                    self.groups.remove(&old);
                }
            }
        }
        let Some(entry) = self.groups.get_mut(&group) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        if kind == SHARD_DATA {
            let slot = &mut entry.data[index as usize];
            if slot.is_some() {
                return Ok(out);
            }
            *slot = Some(payload.to_vec());
            out.push(payload.to_vec());
        } else if entry.parity.is_none() {
            entry.parity = Some((len, payload.to_vec()));
        }

        if let Some(recovered) = entry.recover() {
            out.push(recovered);
        }
        Ok(out)
    }
}

/// Frame reader on top of a datagram flow with parity shards.
pub struct FecReader {
    inner: Box<dyn DatagramRecv>,
    block: Option<Arc<dyn BlockCrypt>>,
    decoder: FecDecoder,
    ready: VecDeque<Vec<u8>>,
}

impl FecReader {
    pub fn new(
        inner: Box<dyn DatagramRecv>,
        block: Option<Arc<dyn BlockCrypt>>,
        config: FecConfig,
    ) -> Self {
        Self {
            inner,
            block,
            decoder: FecDecoder::new(config),
            ready: VecDeque::new(),
        }
    }
}

#[async_trait]
impl FrameReader for FecReader {
    async fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(sealed) = self.ready.pop_front() {
                match open(&self.block, sealed) {
                    Ok(frame) => return Ok(frame),
                    Err(e) => {
                        debug!(error = %e, "Dropping unreadable payload");
                        continue;
                    }
                }
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(TransportError::Timeout);
            }
            let datagram = self.inner.recv(left).await?;
            match self.decoder.decode(&datagram) {
                Ok(payloads) => self.ready.extend(payloads),
                Err(e) => debug!(error = %e, "Dropping malformed shard"),
            }
        }
    }
}

/// Frame writer emitting data and parity shards.
pub struct FecWriter {
    inner: Box<dyn DatagramSend>,
    block: Option<Arc<dyn BlockCrypt>>,
    encoder: FecEncoder,
}

impl FecWriter {
    pub fn new(
        inner: Box<dyn DatagramSend>,
        block: Option<Arc<dyn BlockCrypt>>,
        config: FecConfig,
    ) -> Self {
        Self {
            inner,
            block,
            encoder: FecEncoder::new(config),
        }
    }
}

#[async_trait]
impl FrameWriter for FecWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let sealed = seal(&self.block, frame)?;
        for datagram in self.encoder.encode(&sealed) {
            self.inner.send(&datagram).await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}
