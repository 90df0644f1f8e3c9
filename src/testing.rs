//! Test helpers: a wire-level message decoder and a scriptable link.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;

use crate::connection::{ConnectionState, ForwardLink};
use crate::error::ForwardError;
use crate::protocol::{Entry, EventTime, SendMode};

/// One decoded `[time, record]` pair. Record values must be strings.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEntry {
    pub time: EventTime,
    pub record: Vec<(String, String)>,
}

/// A forward or packed-forward message as seen by a collector.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub tag: String,
    pub packed: bool,
    pub entries: Vec<WireEntry>,
    pub options: Vec<(String, String)>,
}

impl WireMessage {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Decode one message from the front of `buf`; `None` if incomplete.
pub fn parse_message(buf: &[u8]) -> Option<(WireMessage, usize)> {
    let mut rd = buf;
    let len = rmp::decode::read_array_len(&mut rd).ok()?;
    let tag = read_string(&mut rd)?;

    let (packed, entries) = match *rd.first()? {
        0xc4..=0xc6 => {
            let size = rmp::decode::read_bin_len(&mut rd).ok()? as usize;
            if rd.len() < size {
                return None;
            }
            let mut decompressed = Vec::new();
            GzDecoder::new(&rd[..size])
                .read_to_end(&mut decompressed)
                .ok()?;
            rd = &rd[size..];

            let mut stream = &decompressed[..];
            let mut entries = Vec::new();
            while !stream.is_empty() {
                entries.push(read_entry(&mut stream)?);
            }
            (true, entries)
        }
        _ => {
            let count = rmp::decode::read_array_len(&mut rd).ok()?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                entries.push(read_entry(&mut rd)?);
            }
            (false, entries)
        }
    };

    let mut options = Vec::new();
    if len == 3 {
        let count = rmp::decode::read_map_len(&mut rd).ok()?;
        for _ in 0..count {
            let key = read_string(&mut rd)?;
            let value = match *rd.first()? {
                0xa0..=0xbf | 0xd9..=0xdb => read_string(&mut rd)?,
                _ => rmp::decode::read_int::<u64, _>(&mut rd).ok()?.to_string(),
            };
            options.push((key, value));
        }
    }

    let used = buf.len() - rd.len();
    Some((
        WireMessage {
            tag,
            packed,
            entries,
            options,
        },
        used,
    ))
}

fn read_entry(rd: &mut &[u8]) -> Option<WireEntry> {
    if rmp::decode::read_array_len(rd).ok()? != 2 {
        return None;
    }
    let meta = rmp::decode::read_ext_meta(rd).ok()?;
    if meta.typeid != 0 || meta.size != 8 || rd.len() < 8 {
        return None;
    }
    let seconds = u32::from_be_bytes(rd[..4].try_into().ok()?);
    let nanos = u32::from_be_bytes(rd[4..8].try_into().ok()?);
    *rd = &rd[8..];

    let count = rmp::decode::read_map_len(rd).ok()?;
    let mut record = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = read_string(rd)?;
        let value = read_string(rd)?;
        record.push((key, value));
    }

    Some(WireEntry {
        time: EventTime::new(seconds, nanos),
        record,
    })
}

fn read_string(rd: &mut &[u8]) -> Option<String> {
    let len = rmp::decode::read_str_len(rd).ok()? as usize;
    if rd.len() < len {
        return None;
    }
    let s = std::str::from_utf8(&rd[..len]).ok()?.to_string();
    *rd = &rd[len..];
    Some(s)
}

/// Something a [`MockLink`] was asked to do, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Transmit {
        mode: SendMode,
        tag: String,
        entries: Vec<Entry>,
    },
    TransmitDone,
    Reconnect,
    Disconnect,
}

#[derive(Debug, Default)]
struct MockState {
    transmit_results: VecDeque<Result<(), ForwardError>>,
    reconnect_results: VecDeque<Result<(), ForwardError>>,
    disconnect_results: VecDeque<Result<(), ForwardError>>,
    connect_succeeds: bool,
    events: Vec<LinkEvent>,
}

/// Scriptable [`ForwardLink`].
///
/// Results are popped from per-operation queues; an empty queue means
/// success. Clones share state so a test can keep a handle after moving the
/// link into an exporter.
#[derive(Debug, Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
    state_flag: Arc<Mutex<ConnectionState>>,
    in_flight: Arc<AtomicBool>,
    overlapped: Arc<AtomicBool>,
    transmit_delay: Option<Duration>,
}

impl MockLink {
    pub fn new() -> Self {
        let link = Self::default();
        link.state.lock().unwrap().connect_succeeds = true;
        link
    }

    /// Reconnect cycles complete but leave the link disconnected.
    pub fn with_failing_connect(self) -> Self {
        self.state.lock().unwrap().connect_succeeds = false;
        self
    }

    pub fn with_transmit_delay(mut self, delay: Duration) -> Self {
        self.transmit_delay = Some(delay);
        self
    }

    pub fn fail_transmit(&self, err: ForwardError) {
        self.state.lock().unwrap().transmit_results.push_back(Err(err));
    }

    pub fn fail_reconnect(&self, err: ForwardError) {
        self.state.lock().unwrap().reconnect_results.push_back(Err(err));
    }

    pub fn fail_disconnect(&self, err: ForwardError) {
        self.state.lock().unwrap().disconnect_results.push_back(Err(err));
    }

    pub fn events(&self) -> Vec<LinkEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn transmit_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, LinkEvent::Transmit { .. }))
            .count()
    }

    pub fn count(&self, event: &LinkEvent) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn transmitted(&self) -> Vec<(SendMode, String, Vec<Entry>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::Transmit { mode, tag, entries } => Some((mode, tag, entries)),
                _ => None,
            })
            .collect()
    }

    /// Whether two transmissions ever ran at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ForwardLink for MockLink {
    async fn transmit(
        &mut self,
        mode: SendMode,
        tag: &str,
        entries: &[Entry],
    ) -> Result<(), ForwardError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }

        let result = {
            let mut state = self.state.lock().unwrap();
            state.events.push(LinkEvent::Transmit {
                mode,
                tag: tag.to_string(),
                entries: entries.to_vec(),
            });
            state.transmit_results.pop_front().unwrap_or(Ok(()))
        };

        if let Some(delay) = self.transmit_delay {
            tokio::time::sleep(delay).await;
        }

        self.state.lock().unwrap().events.push(LinkEvent::TransmitDone);
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn reconnect(&mut self) -> Result<(), ForwardError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(LinkEvent::Reconnect);
        let result = state.reconnect_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            *self.state_flag.lock().unwrap() = if state.connect_succeeds {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
        }
        result
    }

    async fn disconnect(&mut self) -> Result<(), ForwardError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(LinkEvent::Disconnect);
        *self.state_flag.lock().unwrap() = ConnectionState::Disconnected;
        state.disconnect_results.pop_front().unwrap_or(Ok(()))
    }

    fn state(&self) -> ConnectionState {
        *self.state_flag.lock().unwrap()
    }
}
