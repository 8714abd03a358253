//! Outgoing audio stream
//!
//! A source encodes each block once per distinct format among its sinks and
//! fans the packets out, patching only the recipient id and channel onset
//! for each sink. Sent blocks stay in a history ring so resend requests can
//! be answered without re-encoding.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use super::events::{EventQueue, StreamEvent};
use super::{notify, OutgoingQueue};
use crate::audio::buffer::{frame_chunk_size, frame_count_for};
use crate::audio::{HistoryBuffer, HistoryEntry, SampleFifo};
use crate::clock::TimeDll;
use crate::codec::{create_encoder, is_supported, AudioEncoder};
use crate::config::SourceConfig;
use crate::constants::{EVENT_QUEUE_SIZE, MAX_PACKET_SIZE, OUTGOING_QUEUE_SIZE};
use crate::error::{CodecError, NetworkError, StreamError};
use crate::network::{Endpoint, NodeHandle, NodeOwner, NodeRegistry, PacketSink};
use crate::protocol::stream::{patch_data_recipient, DATA_HEADER_SIZE, MAX_RESEND_PER_REQUEST};
use crate::protocol::{DataFrame, EndpointType, Format, StreamMessage};
use crate::time::TimeTag;

/// Smallest payload a data frame may carry
const MIN_FRAME_PAYLOAD: usize = 64;

/// Measured rates further than this from nominal restart the DLL
const MAX_RATE_DEVIATION: f64 = 0.1;

/// A sink as seen by the source
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SinkInfo {
    pub endpoint: Endpoint,
    pub channel_onset: u16,
    /// Format actually streamed to this sink
    pub format: Format,
    /// Set when the sink has its own format
    pub individual: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SourceStats {
    pub blocks_sent: u64,
    pub blocks_resent: u64,
    pub packets_dropped: u64,
    /// Sample rate measured by the DLL
    pub sample_rate: f64,
}

#[derive(Debug)]
struct SinkDesc {
    endpoint: Endpoint,
    channel_onset: u16,
    format: Option<Format>,
    /// Stream whose format this sink was last told
    announced: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
struct Setup {
    sample_rate: u32,
    channels: usize,
}

/// Encoder state shared by all sinks that receive the same format
struct EncoderGroup {
    format: Format,
    encoder: Box<dyn AudioEncoder>,
    stream_id: i32,
    sequence: u32,
    fifo: SampleFifo,
    history: HistoryBuffer,
    scratch: Vec<f32>,
}

impl EncoderGroup {
    fn new(format: Format, encoder: Box<dyn AudioEncoder>, stream_id: i32, history_ms: u32) -> Self {
        let blocks = (history_ms as f64 / 1000.0 / format.block_duration()).ceil() as usize;
        Self {
            format,
            encoder,
            stream_id,
            sequence: 0,
            fifo: SampleFifo::new(format.channels as usize),
            history: HistoryBuffer::new(blocks),
            scratch: vec![0.0; format.samples_per_block()],
        }
    }

    /// Encode the next block if the FIFO holds one, returning its data messages
    fn encode_block(
        &mut self,
        source_id: i32,
        timestamp: TimeTag,
        sample_rate: f64,
        max_payload: usize,
    ) -> Result<Option<Vec<Bytes>>, CodecError> {
        if !self.fifo.pop_interleaved(&mut self.scratch) {
            return Ok(None);
        }
        let payload = self.encoder.encode(&self.scratch)?;
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let frame_count = frame_count_for(payload.len(), max_payload);
        let chunk = frame_chunk_size(payload.len(), frame_count);
        let packets: Vec<Bytes> = (0..frame_count)
            .map(|index| {
                let start = (index as usize * chunk).min(payload.len());
                let end = (start + chunk).min(payload.len());
                StreamMessage::Data(DataFrame {
                    source_id,
                    stream_id: self.stream_id,
                    sequence,
                    timestamp,
                    sample_rate,
                    channel_onset: 0,
                    total_size: payload.len() as u32,
                    frame_count,
                    frame_index: index,
                    payload: payload.slice(start..end),
                })
                .encode(0)
            })
            .collect();

        self.history.push(HistoryEntry { sequence, stream_id: self.stream_id, packets: packets.clone() });
        Ok(Some(packets))
    }
}

struct SourceState {
    setup: Option<Setup>,
    groups: Vec<EncoderGroup>,
    /// Formats whose encoder could not be created
    failed: Vec<Format>,
    dll: Option<TimeDll>,
    dll_frames: usize,
    sample_rate: f64,
    next_stream_id: i32,
    last_ping: Option<f64>,
    blocks_sent: u64,
}

impl SourceState {
    fn new() -> Self {
        // Different on every start so sinks notice a restarted source
        let seed = (TimeTag::now().raw() >> 12) as i32 & 0x3fff_ffff;
        Self {
            setup: None,
            groups: Vec::new(),
            failed: Vec::new(),
            dll: None,
            dll_frames: 0,
            sample_rate: 0.0,
            next_stream_id: seed,
            last_ping: None,
            blocks_sent: 0,
        }
    }

    fn new_stream_id(&mut self) -> i32 {
        self.next_stream_id = self.next_stream_id.wrapping_add(1) & i32::MAX;
        self.next_stream_id
    }

    /// One encoder per format in use; unused encoders are dropped
    fn sync_groups(&mut self, sinks: &[SinkDesc], config: &SourceConfig) {
        let in_use = |format: &Format| sinks.iter().any(|s| s.format.unwrap_or(config.format) == *format);
        self.groups.retain(|group| in_use(&group.format));

        for sink in sinks {
            let format = sink.format.unwrap_or(config.format);
            if self.groups.iter().any(|g| g.format == format) || self.failed.contains(&format) {
                continue;
            }
            match create_encoder(&format) {
                Ok(encoder) => {
                    let stream_id = self.new_stream_id();
                    tracing::info!("Encoding {} as stream {}", format, stream_id);
                    self.groups.push(EncoderGroup::new(format, encoder, stream_id, config.resend_buffer_ms));
                }
                Err(e) => {
                    tracing::warn!("Cannot encode {}: {}", format, e);
                    self.failed.push(format);
                }
            }
        }
    }

    /// Feed the block time to the DLL and return the measured sample rate
    fn update_dll(&mut self, t: f64, frames: usize, nominal: f64, bandwidth: f64) -> f64 {
        if frames == 0 {
            return nominal;
        }
        let measured = match self.dll.as_mut() {
            Some(dll) if self.dll_frames == frames => {
                dll.update(t);
                Some(dll.sample_rate())
            }
            _ => None,
        };
        self.sample_rate = match measured {
            Some(rate) if (rate - nominal).abs() <= nominal * MAX_RATE_DEVIATION => rate,
            Some(rate) => {
                tracing::debug!("Sample rate estimate {:.1} out of range, restarting DLL", rate);
                self.dll = Some(TimeDll::new(nominal, frames as u32, bandwidth, t));
                nominal
            }
            None => {
                self.dll = Some(TimeDll::new(nominal, frames as u32, bandwidth, t));
                self.dll_frames = frames;
                nominal
            }
        };
        self.sample_rate
    }
}

struct SourceInner {
    id: i32,
    config: RwLock<SourceConfig>,
    state: Mutex<SourceState>,
    sinks: Mutex<Vec<SinkDesc>>,
    pending_invites: Mutex<Vec<Endpoint>>,
    outgoing: OutgoingQueue,
    events: EventQueue<StreamEvent>,
    handle: Mutex<Option<NodeHandle>>,
    blocks_resent: AtomicU64,
}

/// Sending end of an audio stream
#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceInner>,
}

impl Source {
    pub fn new(id: i32, config: SourceConfig) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                id,
                config: RwLock::new(config),
                state: Mutex::new(SourceState::new()),
                sinks: Mutex::new(Vec::new()),
                pending_invites: Mutex::new(Vec::new()),
                outgoing: OutgoingQueue::new(OUTGOING_QUEUE_SIZE),
                events: EventQueue::new(EVENT_QUEUE_SIZE),
                handle: Mutex::new(None),
                blocks_resent: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> i32 {
        self.inner.id
    }

    /// What to register with a [`NodeRegistry`]
    pub fn owner(&self) -> Arc<dyn NodeOwner> {
        self.inner.clone()
    }

    /// Send and receive through `handle` from now on
    pub fn attach(&self, handle: NodeHandle) {
        tracing::debug!("Source {} attached to port {}", self.inner.id, handle.port());
        let old = self.inner.handle.lock().replace(handle);
        drop(old);
    }

    /// Acquire `port` from `registry` and attach to it. Returns the bound port.
    pub fn bind(&self, registry: &NodeRegistry, port: u16) -> Result<u16, NetworkError> {
        let handle = registry.acquire(port, &self.owner(), self.inner.id)?;
        let port = handle.port();
        self.attach(handle);
        Ok(port)
    }

    pub fn detach(&self) -> Option<NodeHandle> {
        self.inner.handle.lock().take()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.handle.lock().as_ref().map(|h| h.local_addr())
    }

    /// Prepare for `process` calls with the given host parameters
    pub fn setup(&self, sample_rate: u32, block_size: u32, channels: usize) {
        {
            let mut config = self.inner.config.write();
            if config.format.sample_rate != sample_rate {
                tracing::info!(
                    "Source {}: format sample rate {} follows host rate {}",
                    self.inner.id,
                    config.format.sample_rate,
                    sample_rate
                );
                config.format.sample_rate = sample_rate;
            }
        }
        tracing::debug!(
            "Source {} set up for {} Hz, {} frames, {} channels",
            self.inner.id,
            sample_rate,
            block_size,
            channels
        );
        let mut state = self.inner.state.lock();
        state.setup = Some(Setup { sample_rate, channels });
        state.groups.clear();
        state.failed.clear();
        state.dll = None;
        state.last_ping = None;
    }

    pub fn config(&self) -> SourceConfig {
        self.inner.config.read().clone()
    }

    pub fn set_config(&self, config: SourceConfig) -> Result<(), StreamError> {
        self.inner.check_format(&config.format)?;
        check_packet_size(config.packet_size)?;
        *self.inner.config.write() = config;
        // Encoders and histories are rebuilt with the new settings
        let mut state = self.inner.state.lock();
        state.groups.clear();
        state.failed.clear();
        Ok(())
    }

    /// Default format for sinks without an individual one
    pub fn set_format(&self, format: Format) -> Result<(), StreamError> {
        self.inner.check_format(&format)?;
        self.inner.config.write().format = format;
        self.inner.state.lock().failed.clear();
        tracing::info!("Source {} format set to {}", self.inner.id, format);
        Ok(())
    }

    pub fn format(&self) -> Format {
        self.inner.config.read().format
    }

    /// Stream `format` to one sink only
    pub fn set_sink_format(&self, endpoint: Endpoint, format: Format) -> Result<(), StreamError> {
        self.inner.set_sink_format(endpoint, Some(format))
    }

    /// Go back to the default format for `endpoint`
    pub fn clear_sink_format(&self, endpoint: Endpoint) -> Result<(), StreamError> {
        self.inner.set_sink_format(endpoint, None)
    }

    pub fn set_packet_size(&self, packet_size: usize) -> Result<(), StreamError> {
        check_packet_size(packet_size)?;
        self.inner.config.write().packet_size = packet_size;
        Ok(())
    }

    pub fn set_redundancy(&self, redundancy: u32) {
        self.inner.config.write().redundancy = redundancy.max(1);
    }

    pub fn set_ping_interval(&self, interval_ms: u32) {
        self.inner.config.write().ping_interval_ms = interval_ms;
    }

    /// Add a sink, or move an existing one to `channel_onset`
    pub fn add_sink(&self, endpoint: Endpoint, channel_onset: u16) -> bool {
        self.inner.add_sink(endpoint, channel_onset)
    }

    pub fn set_sink_channel_onset(&self, endpoint: Endpoint, channel_onset: u16) -> Result<(), StreamError> {
        let mut sinks = self.inner.sinks.lock();
        let sink = sinks
            .iter_mut()
            .find(|s| s.endpoint == endpoint)
            .ok_or_else(|| StreamError::UnknownEndpoint(endpoint.to_string()))?;
        sink.channel_onset = channel_onset;
        Ok(())
    }

    pub fn remove_sink(&self, endpoint: Endpoint) -> bool {
        self.inner.remove_sink(endpoint)
    }

    pub fn remove_all(&self) {
        let removed = std::mem::take(&mut *self.inner.sinks.lock());
        if !removed.is_empty() {
            tracing::info!("Source {} removed all {} sinks", self.inner.id, removed.len());
        }
    }

    pub fn sinks(&self) -> Vec<SinkInfo> {
        let default = self.inner.config.read().format;
        self.inner
            .sinks
            .lock()
            .iter()
            .map(|s| SinkInfo {
                endpoint: s.endpoint,
                channel_onset: s.channel_onset,
                format: s.format.unwrap_or(default),
                individual: s.format.is_some(),
            })
            .collect()
    }

    /// Invitations waiting for a decision (only with `auto_accept_invites` off)
    pub fn pending_invites(&self) -> Vec<Endpoint> {
        self.inner.pending_invites.lock().clone()
    }

    /// Answer an invitation. Returns false if `endpoint` had not invited us.
    pub fn handle_invite(&self, endpoint: Endpoint, accept: bool) -> bool {
        let found = {
            let mut pending = self.inner.pending_invites.lock();
            let before = pending.len();
            pending.retain(|e| *e != endpoint);
            pending.len() != before
        };
        if found && accept {
            self.inner.add_sink(endpoint, 0);
        }
        found
    }

    /// Encode one host block and queue it for every sink.
    ///
    /// `inputs` holds one slice per channel; `now` is the virtual time of
    /// the block.
    pub fn process(&self, inputs: &[&[f32]], now: TimeTag) -> Result<(), StreamError> {
        self.inner.process(inputs, now)
    }

    pub fn poll_events(&self) -> Vec<StreamEvent> {
        self.inner.events.poll()
    }

    pub fn events(&self) -> &EventQueue<StreamEvent> {
        &self.inner.events
    }

    pub fn stats(&self) -> SourceStats {
        let state = self.inner.state.lock();
        SourceStats {
            blocks_sent: state.blocks_sent,
            blocks_resent: self.inner.blocks_resent.load(Ordering::Relaxed),
            packets_dropped: self.inner.outgoing.dropped(),
            sample_rate: state.sample_rate,
        }
    }
}

fn check_packet_size(packet_size: usize) -> Result<(), StreamError> {
    if packet_size < DATA_HEADER_SIZE + MIN_FRAME_PAYLOAD || packet_size > MAX_PACKET_SIZE {
        return Err(StreamError::InvalidConfig(format!("packet size {} out of range", packet_size)));
    }
    Ok(())
}

/// Copy of a data message addressed to one sink
fn patched(packet: &Bytes, sink_id: i32, channel_onset: u16) -> Bytes {
    let mut buf = BytesMut::from(&packet[..]);
    patch_data_recipient(&mut buf, sink_id, channel_onset);
    buf.freeze()
}

impl SourceInner {
    fn check_format(&self, format: &Format) -> Result<(), StreamError> {
        format.validate().map_err(|e| StreamError::InvalidConfig(e.to_string()))?;
        if !is_supported(format) {
            return Err(StreamError::InvalidConfig(format!("codec {} not available", format.codec_name())));
        }
        if let Some(setup) = self.state.lock().setup {
            if setup.sample_rate != format.sample_rate {
                return Err(StreamError::InvalidConfig(format!(
                    "sample rate {} differs from host rate {}",
                    format.sample_rate, setup.sample_rate
                )));
            }
        }
        Ok(())
    }

    fn set_sink_format(&self, endpoint: Endpoint, format: Option<Format>) -> Result<(), StreamError> {
        if let Some(format) = &format {
            self.check_format(format)?;
        }
        let mut sinks = self.sinks.lock();
        let sink = sinks
            .iter_mut()
            .find(|s| s.endpoint == endpoint)
            .ok_or_else(|| StreamError::UnknownEndpoint(endpoint.to_string()))?;
        sink.format = format;
        Ok(())
    }

    fn add_sink(&self, endpoint: Endpoint, channel_onset: u16) -> bool {
        let mut sinks = self.sinks.lock();
        if let Some(sink) = sinks.iter_mut().find(|s| s.endpoint == endpoint) {
            sink.channel_onset = channel_onset;
            return false;
        }
        sinks.push(SinkDesc { endpoint, channel_onset, format: None, announced: None });
        tracing::info!("Source {} added sink {} at channel {}", self.id, endpoint, channel_onset);
        true
    }

    fn remove_sink(&self, endpoint: Endpoint) -> bool {
        let mut sinks = self.sinks.lock();
        let before = sinks.len();
        sinks.retain(|s| s.endpoint != endpoint);
        let removed = sinks.len() != before;
        if removed {
            tracing::info!("Source {} removed sink {}", self.id, endpoint);
        }
        removed
    }

    fn process(&self, inputs: &[&[f32]], now: TimeTag) -> Result<(), StreamError> {
        let config = self.config.read().clone();
        let mut state = self.state.lock();
        let setup = state.setup.ok_or(StreamError::NotSetUp)?;
        if inputs.len() < setup.channels {
            return Err(StreamError::ChannelMismatch { expected: setup.channels, actual: inputs.len() });
        }
        let frames = inputs.first().map_or(0, |c| c.len());
        let t = now.to_seconds();
        let sample_rate = state.update_dll(t, frames, setup.sample_rate as f64, config.dll_bandwidth);
        let max_payload = config.packet_size.saturating_sub(DATA_HEADER_SIZE).max(MIN_FRAME_PAYLOAD);
        let mut queued = false;

        {
            let mut sinks = self.sinks.lock();
            state.sync_groups(&sinks, &config);

            for sink in sinks.iter_mut() {
                let format = sink.format.unwrap_or(config.format);
                let Some(group) = state.groups.iter().find(|g| g.format == format) else {
                    continue;
                };
                if sink.announced != Some(group.stream_id) {
                    let message = StreamMessage::Format { source_id: self.id, stream_id: group.stream_id, format };
                    queued |= self.outgoing.push(sink.endpoint.addr, message.encode(sink.endpoint.id));
                    sink.announced = Some(group.stream_id);
                }
            }

            let mut blocks = 0;
            for group in state.groups.iter_mut() {
                group.fifo.push_planar(&inputs[..setup.channels], frames);
                loop {
                    let packets = match group.encode_block(self.id, now, sample_rate, max_payload) {
                        Ok(Some(packets)) => packets,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("Source {}: {}", self.id, e);
                            group.fifo.clear();
                            break;
                        }
                    };
                    blocks += 1;
                    for sink in sinks.iter().filter(|s| s.format.unwrap_or(config.format) == group.format) {
                        for packet in &packets {
                            let packet = patched(packet, sink.endpoint.id, sink.channel_onset);
                            for _ in 0..config.redundancy.max(1) {
                                queued |= self.outgoing.push(sink.endpoint.addr, packet.clone());
                            }
                        }
                    }
                }
            }
            state.blocks_sent += blocks;

            let interval = config.ping_interval_ms as f64 / 1000.0;
            if interval > 0.0 && !sinks.is_empty() && state.last_ping.map_or(true, |last| t - last >= interval) {
                state.last_ping = Some(t);
                for sink in sinks.iter() {
                    let ping = StreamMessage::Ping { source_id: self.id, sent: now };
                    queued |= self.outgoing.push(sink.endpoint.addr, ping.encode(sink.endpoint.id));
                }
            }
        }
        drop(state);

        if queued {
            notify(&self.handle);
        }
        Ok(())
    }

    fn on_format_request(&self, endpoint: Endpoint) {
        let mut sinks = self.sinks.lock();
        match sinks.iter_mut().find(|s| s.endpoint == endpoint) {
            Some(sink) => {
                tracing::debug!("Source {}: {} requested the format", self.id, endpoint);
                sink.announced = None;
            }
            None => tracing::debug!("Source {}: format request from unknown sink {}", self.id, endpoint),
        }
    }

    fn on_resend_request(&self, endpoint: Endpoint, stream_id: i32, sequences: &[u32]) {
        let onset = match self.sinks.lock().iter().find(|s| s.endpoint == endpoint) {
            Some(sink) => sink.channel_onset,
            None => {
                tracing::debug!("Source {}: resend request from unknown sink {}", self.id, endpoint);
                return;
            }
        };

        let mut resent = 0;
        {
            let state = self.state.lock();
            let Some(group) = state.groups.iter().find(|g| g.stream_id == stream_id) else {
                tracing::debug!("Source {}: resend request for old stream {}", self.id, stream_id);
                return;
            };
            for &sequence in sequences.iter().take(MAX_RESEND_PER_REQUEST) {
                match group.history.find(stream_id, sequence) {
                    Some(entry) => {
                        for packet in &entry.packets {
                            self.outgoing.push(endpoint.addr, patched(packet, endpoint.id, onset));
                        }
                        resent += 1;
                    }
                    None => tracing::trace!("Block {} no longer in history", sequence),
                }
            }
        }

        if resent > 0 {
            tracing::trace!("Source {}: resending {} blocks to {}", self.id, resent, endpoint);
            self.blocks_resent.fetch_add(resent, Ordering::Relaxed);
            notify(&self.handle);
        }
    }

    fn on_ping_reply(&self, endpoint: Endpoint, sent: TimeTag, received: TimeTag, lost: u32) {
        let now = TimeTag::now();
        self.events.push(StreamEvent::Ping {
            endpoint,
            rtt_ms: TimeTag::duration(sent, now) * 1000.0,
            out_ms: TimeTag::duration(sent, received) * 1000.0,
            in_ms: TimeTag::duration(received, now) * 1000.0,
            lost,
        });
    }

    fn on_invite(&self, endpoint: Endpoint) {
        {
            let mut sinks = self.sinks.lock();
            if let Some(sink) = sinks.iter_mut().find(|s| s.endpoint == endpoint) {
                // Invitation repeated before our data arrived
                sink.announced = None;
                return;
            }
        }
        tracing::info!("Source {} invited by {}", self.id, endpoint);
        self.events.push(StreamEvent::Invite { endpoint });

        if self.config.read().auto_accept_invites {
            self.add_sink(endpoint, 0);
        } else {
            let mut pending = self.pending_invites.lock();
            if !pending.contains(&endpoint) {
                pending.push(endpoint);
            }
        }
    }

    fn on_uninvite(&self, endpoint: Endpoint) {
        self.pending_invites.lock().retain(|e| *e != endpoint);
        if self.remove_sink(endpoint) {
            self.events.push(StreamEvent::Uninvite { endpoint });
        }
    }

    fn on_codec_change(&self, endpoint: Endpoint, format: Format) {
        self.events.push(StreamEvent::CodecChange { endpoint, format });
        if !self.config.read().accept_codec_change {
            return;
        }
        match self.set_sink_format(endpoint, Some(format)) {
            Ok(()) => tracing::info!("Source {}: {} switched to {}", self.id, endpoint, format),
            Err(e) => tracing::warn!("Source {}: rejected codec change from {}: {}", self.id, endpoint, e),
        }
    }
}

impl NodeOwner for SourceInner {
    fn kind(&self) -> EndpointType {
        EndpointType::Source
    }

    fn id(&self) -> i32 {
        self.id
    }

    fn handle_message(&self, data: &[u8], from: SocketAddr) {
        let message = match StreamMessage::decode(data) {
            Ok((_, message)) => message,
            Err(e) => {
                tracing::debug!("Source {}: dropping datagram from {}: {}", self.id, from, e);
                return;
            }
        };
        match message {
            StreamMessage::FormatRequest { sink_id } => self.on_format_request(Endpoint::new(from, sink_id)),
            StreamMessage::ResendRequest { sink_id, stream_id, sequences } => {
                self.on_resend_request(Endpoint::new(from, sink_id), stream_id, &sequences)
            }
            StreamMessage::PingReply { sink_id, sent, received, lost } => {
                self.on_ping_reply(Endpoint::new(from, sink_id), sent, received, lost)
            }
            StreamMessage::Invite { sink_id } => self.on_invite(Endpoint::new(from, sink_id)),
            StreamMessage::Uninvite { sink_id } => self.on_uninvite(Endpoint::new(from, sink_id)),
            StreamMessage::CodecChange { sink_id, format } => self.on_codec_change(Endpoint::new(from, sink_id), format),
            other => tracing::debug!("Source {}: unexpected message kind {} from {}", self.id, other.kind(), from),
        }
    }

    fn flush(&self, sink: &dyn PacketSink) {
        self.outgoing.flush(sink);
    }
}
