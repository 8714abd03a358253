//! Incoming audio streams
//!
//! A sink keeps one jitter buffer per remote source. The receive thread
//! inserts frames, the audio thread pops, decodes and mixes blocks into the
//! output channels starting at the channel onset the source chose. Each
//! buffer sits behind its own lock, held only while the buffer is touched;
//! resend requests and events are built after it is released.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::events::{EventQueue, StreamEvent, StreamState};
use super::resend::ResendTracker;
use super::sizing::BufferSizer;
use super::{notify, OutgoingQueue};
use crate::audio::{InsertStatus, JitterBuffer, JitterBufferStats, PopResult, SampleFifo};
use crate::codec::{create_decoder, AudioDecoder};
use crate::config::{BufferMode, SinkConfig};
use crate::constants::{EVENT_QUEUE_SIZE, OUTGOING_QUEUE_SIZE};
use crate::error::{NetworkError, StreamError};
use crate::network::{Endpoint, NodeHandle, NodeOwner, NodeRegistry, PacketSink};
use crate::protocol::stream::MAX_RESEND_PER_REQUEST;
use crate::protocol::{DataFrame, EndpointType, Format, StreamMessage};
use crate::time::TimeTag;

/// A jitter buffer always holds at least this many blocks
const MIN_BUFFER_BLOCKS: usize = 2;

const FILL_SMOOTHING: f64 = 0.05;

/// Jitter buffer capacity in blocks for `buffer_ms` of `format`
fn capacity_for(buffer_ms: f64, format: &Format) -> usize {
    let blocks = (buffer_ms / (format.block_duration() * 1000.0) - 1e-6).ceil();
    (blocks as usize).max(MIN_BUFFER_BLOCKS)
}

/// Linear ramp over one interleaved block
fn fade_in(samples: &mut [f32], channels: usize) {
    let frames = samples.len() / channels.max(1);
    if frames == 0 {
        return;
    }
    for (i, frame) in samples.chunks_mut(channels.max(1)).enumerate() {
        let gain = (i + 1) as f32 / frames as f32;
        for sample in frame {
            *sample *= gain;
        }
    }
}

/// Snapshot of one remote source
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceInfo {
    pub endpoint: Endpoint,
    pub format: Option<Format>,
    pub stream_id: Option<i32>,
    /// `None` until the first block played
    pub state: Option<StreamState>,
    pub buffer_ms: f64,
    pub buffer_mode: BufferMode,
    pub fill_ratio: f64,
    /// Standard deviation of the block arrival interval
    pub jitter_ms: f64,
    /// Sample rate the source measured
    pub sample_rate: f64,
    pub stats: JitterBufferStats,
    pub resend_requests: u64,
}

#[derive(Debug, Clone, Copy)]
struct Setup {
    channels: usize,
}

#[derive(Debug, Clone, Copy)]
struct PendingFormat {
    first: f64,
    last: f64,
}

#[derive(Debug, Clone, Copy)]
struct Invitation {
    endpoint: Endpoint,
    started: f64,
    last_sent: f64,
}

/// A source we asked to stop; its data is refused for a while
#[derive(Debug, Clone, Copy)]
struct Uninvited {
    endpoint: Endpoint,
    until: f64,
    last_sent: f64,
}

/// Playback state of one remote source, guarded by its own lock
struct RemoteStream {
    endpoint: Endpoint,
    stream_id: Option<i32>,
    format: Option<Format>,
    decoder: Option<Box<dyn AudioDecoder>>,
    buffer: JitterBuffer,
    resend: ResendTracker,
    sizer: BufferSizer,
    fifo: SampleFifo,
    scratch: Vec<f32>,
    missing: Vec<u32>,
    channel_onset: u16,
    state: Option<StreamState>,
    fade_pending: bool,
    sample_rate: f64,
    last_packet: f64,
    lost_since_ping: u32,
    pending_format: Option<PendingFormat>,
    fill_mean: f64,
    fill_var: f64,
}

impl RemoteStream {
    fn new(endpoint: Endpoint, config: &SinkConfig, now: f64) -> Self {
        Self {
            endpoint,
            stream_id: None,
            format: None,
            decoder: None,
            buffer: JitterBuffer::new(MIN_BUFFER_BLOCKS),
            resend: ResendTracker::new(config.resend_limit, config.resend_interval_ms, config.reorder_window),
            sizer: BufferSizer::new(config.buffer_mode, config.buffer_ms, config.max_buffer_ms),
            fifo: SampleFifo::new(1),
            scratch: Vec::new(),
            missing: Vec::new(),
            channel_onset: 0,
            state: None,
            fade_pending: true,
            sample_rate: 0.0,
            last_packet: now,
            lost_since_ping: 0,
            pending_format: None,
            fill_mean: 0.0,
            fill_var: 0.0,
        }
    }

    fn set_format(&mut self, stream_id: i32, format: Format, config: &SinkConfig, events: &mut Vec<StreamEvent>) {
        if self.stream_id == Some(stream_id) && self.format == Some(format) {
            return;
        }
        self.stream_id = Some(stream_id);
        self.pending_format = None;
        self.buffer.reset();
        self.resend.clear();
        self.sizer.restart();
        self.fade_pending = true;

        let block_ms = format.block_duration() * 1000.0;
        self.sizer.set_limits(block_ms * MIN_BUFFER_BLOCKS as f64, config.max_buffer_ms);
        self.buffer.resize(capacity_for(self.sizer.size_ms(), &format));

        if self.format == Some(format) {
            // Same format, restarted stream
            if let Some(decoder) = self.decoder.as_mut() {
                decoder.reset();
            }
            self.fifo.clear();
            return;
        }

        self.decoder = match create_decoder(&format) {
            Ok(decoder) => Some(decoder),
            Err(e) => {
                tracing::warn!("Cannot decode stream from {}: {}", self.endpoint, e);
                None
            }
        };
        self.fifo = SampleFifo::new(format.channels as usize);
        self.scratch = vec![0.0; format.samples_per_block()];
        self.format = Some(format);
        events.push(StreamEvent::FormatChange { endpoint: self.endpoint, format });
    }

    /// Whether a format request should go out for data of an unknown stream
    fn wants_format(&mut self, now: f64, interval: f64) -> bool {
        match self.pending_format.as_mut() {
            None => {
                self.pending_format = Some(PendingFormat { first: now, last: now });
                true
            }
            Some(pending) if now - pending.last >= interval => {
                pending.last = now;
                true
            }
            Some(_) => false,
        }
    }

    fn insert(&mut self, frame: &DataFrame, arrival: f64, events: &mut Vec<StreamEvent>) {
        let endpoint = self.endpoint;
        if let Some(format) = self.format {
            if frame.total_size as usize > format.max_block_bytes() {
                tracing::debug!(
                    "Dropping block {} from {}: {} bytes exceed {}",
                    frame.sequence,
                    endpoint,
                    frame.total_size,
                    format
                );
                return;
            }
        }
        let result = self.buffer.insert(frame);
        self.sample_rate = frame.sample_rate;

        match result.status {
            InsertStatus::Stored { complete: true } => {
                if self.resend.take(frame.sequence) {
                    events.push(StreamEvent::BlockResent { endpoint, count: 1 });
                } else if result.out_of_order {
                    events.push(StreamEvent::BlockReordered { endpoint, count: 1 });
                } else if let Some(format) = self.format {
                    self.sizer.record_arrival(arrival, format.block_duration());
                }
            }
            InsertStatus::Stored { complete: false } => {}
            InsertStatus::Duplicate => {
                tracing::trace!("Duplicate block {} from {}", frame.sequence, endpoint);
            }
            InsertStatus::Reset { skipped } => {
                tracing::debug!("Stream from {} skipped {} blocks", endpoint, skipped);
                events.push(StreamEvent::BlockGap { endpoint, count: skipped });
                self.resend.clear();
                self.fade_pending = true;
                self.lost_since_ping = self.lost_since_ping.saturating_add(skipped);
                self.sizer.record_drops(skipped, arrival);
            }
        }

        if result.evicted > 0 {
            events.push(StreamEvent::BlockLost { endpoint, count: result.evicted });
            self.lost_since_ping = self.lost_since_ping.saturating_add(result.evicted);
            self.sizer.record_drops(result.evicted, arrival);
        }
    }

    fn apply_buffer_size(&mut self, events: &mut Vec<StreamEvent>) {
        let Some(format) = self.format else {
            return;
        };
        let dropped = self.buffer.resize(capacity_for(self.sizer.size_ms(), &format));
        if dropped > 0 {
            events.push(StreamEvent::BlockLost { endpoint: self.endpoint, count: dropped });
            self.lost_since_ping = self.lost_since_ping.saturating_add(dropped);
        }
    }

    /// Mix one host block into `outputs`. Returns the blocks to request again.
    fn process(
        &mut self,
        outputs: &mut [&mut [f32]],
        frames: usize,
        now: f64,
        config: &SinkConfig,
        events: &mut Vec<StreamEvent>,
    ) -> Option<(i32, Vec<u32>)> {
        let endpoint = self.endpoint;

        if let Some((old_ms, new_ms)) = self.sizer.update(now) {
            self.apply_buffer_size(events);
            events.push(StreamEvent::BufferResize { endpoint, old_ms, new_ms });
        }

        if let Some(pending) = self.pending_format {
            if now - pending.first >= config.format_timeout_ms / 1000.0 {
                tracing::warn!("No format from {}", endpoint);
                events.push(StreamEvent::FormatTimeout { endpoint });
                self.pending_format = None;
            }
        }

        let format = self.format?;
        let stream_id = self.stream_id?;
        let Some(decoder) = self.decoder.as_mut() else {
            // Undecodable stream: keep the buffer from overflowing
            self.buffer.reset();
            return None;
        };

        let channels = format.channels as usize;
        let mut lost = 0u32;
        let mut underruns = 0u32;
        while self.fifo.frames() < frames {
            match self.buffer.pop() {
                PopResult::Buffering => break,
                PopResult::Block(block) => {
                    match decoder.decode(&block.data, &mut self.scratch) {
                        Ok(()) => {
                            if self.fade_pending && config.fade_in {
                                fade_in(&mut self.scratch, channels);
                            }
                            self.fade_pending = false;
                        }
                        Err(e) => {
                            tracing::debug!("Block {} from {}: {}", block.sequence, endpoint, e);
                            self.scratch.fill(0.0);
                            self.fade_pending = true;
                        }
                    }
                    self.channel_onset = block.channel_onset;
                    self.fifo.push_interleaved(&self.scratch);
                    if self.state != Some(StreamState::Active) {
                        self.state = Some(StreamState::Active);
                        events.push(StreamEvent::StreamStateChange { endpoint, state: StreamState::Active });
                    }
                }
                PopResult::Missing(sequence) => {
                    tracing::trace!("Block {} from {} lost", sequence, endpoint);
                    lost += 1;
                    if decoder.conceal(&mut self.scratch).is_err() {
                        self.scratch.fill(0.0);
                    }
                    self.fifo.push_interleaved(&self.scratch);
                    self.fade_pending = true;
                }
                PopResult::Underrun => {
                    underruns += 1;
                    self.fade_pending = true;
                    if self.state == Some(StreamState::Active) {
                        self.state = Some(StreamState::Idle);
                        events.push(StreamEvent::StreamStateChange { endpoint, state: StreamState::Idle });
                    }
                    break;
                }
            }
        }
        self.fifo.pop_planar(outputs, self.channel_onset as usize, frames);

        if lost > 0 {
            events.push(StreamEvent::BlockLost { endpoint, count: lost });
            self.lost_since_ping = self.lost_since_ping.saturating_add(lost);
        }
        if underruns > 0 {
            tracing::debug!("Underrun on stream from {}", endpoint);
            events.push(StreamEvent::Underrun { endpoint, count: underruns });
        }
        self.sizer.record_drops(lost + underruns, now);

        let ratio = self.buffer.fill_ratio();
        let delta = ratio - self.fill_mean;
        self.fill_mean += FILL_SMOOTHING * delta;
        self.fill_var = (1.0 - FILL_SMOOTHING) * (self.fill_var + FILL_SMOOTHING * delta * delta);

        if !config.resend_enabled {
            return None;
        }
        let newest = self.buffer.newest_sequence()?;
        self.missing.clear();
        self.missing.extend(self.buffer.missing());
        if self.missing.is_empty() && self.resend.outstanding() == 0 {
            return None;
        }
        let requests = self.resend.update(&self.missing, newest, now);
        (!requests.is_empty()).then_some((stream_id, requests))
    }

    fn info(&self) -> SourceInfo {
        SourceInfo {
            endpoint: self.endpoint,
            format: self.format,
            stream_id: self.stream_id,
            state: self.state,
            buffer_ms: self.sizer.size_ms(),
            buffer_mode: self.sizer.mode(),
            fill_ratio: self.buffer.fill_ratio(),
            jitter_ms: self.sizer.arrivals().jitter() * 1000.0,
            sample_rate: self.sample_rate,
            stats: self.buffer.stats(),
            resend_requests: self.resend.requests_sent(),
        }
    }
}

struct RemoteSource {
    endpoint: Endpoint,
    stream: Mutex<RemoteStream>,
}

struct SinkInner {
    id: i32,
    config: RwLock<SinkConfig>,
    setup: RwLock<Option<Setup>>,
    sources: RwLock<Vec<Arc<RemoteSource>>>,
    invites: Mutex<Vec<Invitation>>,
    uninvited: Mutex<Vec<Uninvited>>,
    outgoing: OutgoingQueue,
    events: EventQueue<StreamEvent>,
    handle: Mutex<Option<NodeHandle>>,
    /// Raw time tag of the last `process` call
    time: AtomicU64,
}

/// Receiving end of audio streams from any number of sources
#[derive(Clone)]
pub struct Sink {
    inner: Arc<SinkInner>,
}

impl Sink {
    pub fn new(id: i32, config: SinkConfig) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                id,
                config: RwLock::new(config),
                setup: RwLock::new(None),
                sources: RwLock::new(Vec::new()),
                invites: Mutex::new(Vec::new()),
                uninvited: Mutex::new(Vec::new()),
                outgoing: OutgoingQueue::new(OUTGOING_QUEUE_SIZE),
                events: EventQueue::new(EVENT_QUEUE_SIZE),
                handle: Mutex::new(None),
                time: AtomicU64::new(0),
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

    pub fn attach(&self, handle: NodeHandle) {
        tracing::debug!("Sink {} attached to port {}", self.inner.id, handle.port());
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

    pub fn setup(&self, sample_rate: u32, block_size: u32, channels: usize) {
        tracing::debug!(
            "Sink {} set up for {} Hz, {} frames, {} channels",
            self.inner.id,
            sample_rate,
            block_size,
            channels
        );
        *self.inner.setup.write() = Some(Setup { channels });
    }

    pub fn config(&self) -> SinkConfig {
        self.inner.config.read().clone()
    }

    pub fn set_config(&self, config: SinkConfig) -> Result<(), StreamError> {
        if !(config.buffer_ms > 0.0) || config.max_buffer_ms < config.buffer_ms {
            return Err(StreamError::InvalidConfig(format!(
                "buffer {} ms with maximum {} ms",
                config.buffer_ms, config.max_buffer_ms
            )));
        }
        let mut events = Vec::new();
        for source in self.inner.sources.read().iter() {
            let mut stream = source.stream.lock();
            stream.resend.configure(config.resend_limit, config.resend_interval_ms, config.reorder_window);
            if stream.sizer.mode() != config.buffer_mode {
                stream.sizer.set_mode(config.buffer_mode);
            }
            let block_ms = stream.format.map_or(0.0, |f| f.block_duration() * 1000.0);
            stream.sizer.set_limits(block_ms * MIN_BUFFER_BLOCKS as f64, config.max_buffer_ms);
            stream.sizer.set_size(config.buffer_ms);
            stream.apply_buffer_size(&mut events);
        }
        *self.inner.config.write() = config;
        self.inner.events.extend(events);
        Ok(())
    }

    /// Jitter buffer size for every source
    pub fn set_buffer_size(&self, buffer_ms: f64) -> Result<(), StreamError> {
        let mut config = self.config();
        config.buffer_ms = buffer_ms;
        config.max_buffer_ms = config.max_buffer_ms.max(buffer_ms);
        self.set_config(config)
    }

    pub fn set_buffer_mode(&self, mode: BufferMode) {
        self.inner.config.write().buffer_mode = mode;
        for source in self.inner.sources.read().iter() {
            source.stream.lock().sizer.set_mode(mode);
        }
    }

    pub fn set_resend(&self, enabled: bool, limit: u32, interval_ms: f64) {
        let mut config = self.inner.config.write();
        config.resend_enabled = enabled;
        config.resend_limit = limit;
        config.resend_interval_ms = interval_ms;
        for source in self.inner.sources.read().iter() {
            source.stream.lock().resend.configure(limit, interval_ms, config.reorder_window);
        }
    }

    /// Ask `endpoint` to stream to us
    pub fn invite_source(&self, endpoint: Endpoint) {
        self.inner.invite(endpoint);
    }

    /// Ask `endpoint` to stop and forget it
    pub fn uninvite_source(&self, endpoint: Endpoint) {
        self.inner.uninvite(endpoint);
    }

    pub fn uninvite_all(&self) {
        let mut endpoints: Vec<Endpoint> = self.inner.sources.read().iter().map(|s| s.endpoint).collect();
        endpoints.extend(self.inner.invites.lock().iter().map(|i| i.endpoint));
        endpoints.sort();
        endpoints.dedup();
        for endpoint in endpoints {
            self.inner.uninvite(endpoint);
        }
    }

    /// Ask a source to stream a different format to us
    pub fn request_format_change(&self, endpoint: Endpoint, format: Format) -> Result<(), StreamError> {
        format.validate().map_err(|e| StreamError::InvalidConfig(e.to_string()))?;
        if self.inner.find(endpoint).is_none() {
            return Err(StreamError::UnknownEndpoint(endpoint.to_string()));
        }
        let message = StreamMessage::CodecChange { sink_id: self.inner.id, format };
        if self.inner.outgoing.push(endpoint.addr, message.encode(endpoint.id)) {
            notify(&self.inner.handle);
        }
        Ok(())
    }

    /// Decode and mix one host block from every source into `outputs`.
    ///
    /// The outputs are overwritten; channels nobody streams to stay silent.
    pub fn process(&self, outputs: &mut [&mut [f32]], now: TimeTag) -> Result<(), StreamError> {
        self.inner.process(outputs, now)
    }

    /// Feed a datagram as if it arrived at `arrival`
    pub fn handle_message_at(&self, data: &[u8], from: SocketAddr, arrival: TimeTag) {
        self.inner.handle_message_at(data, from, arrival);
    }

    /// `(fill ratio, its standard deviation)` of one source's buffer
    pub fn buffer_fill_ratio(&self, endpoint: Endpoint) -> Option<(f64, f64)> {
        let source = self.inner.find(endpoint)?;
        let stream = source.stream.lock();
        Some((stream.buffer.fill_ratio(), stream.fill_var.sqrt()))
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        self.inner.sources.read().iter().map(|s| s.stream.lock().info()).collect()
    }

    pub fn source_info(&self, endpoint: Endpoint) -> Option<SourceInfo> {
        self.inner.find(endpoint).map(|s| s.stream.lock().info())
    }

    pub fn poll_events(&self) -> Vec<StreamEvent> {
        self.inner.events.poll()
    }

    pub fn events(&self) -> &EventQueue<StreamEvent> {
        &self.inner.events
    }
}

impl SinkInner {
    /// Current stream time: the last processed block, or the wall clock before that
    fn now(&self) -> f64 {
        match self.time.load(Ordering::Acquire) {
            0 => TimeTag::now().to_seconds(),
            raw => TimeTag::from_raw(raw).to_seconds(),
        }
    }

    fn find(&self, endpoint: Endpoint) -> Option<Arc<RemoteSource>> {
        self.sources.read().iter().find(|s| s.endpoint == endpoint).cloned()
    }

    fn find_or_add(&self, endpoint: Endpoint, now: f64, events: &mut Vec<StreamEvent>) -> Arc<RemoteSource> {
        if let Some(source) = self.find(endpoint) {
            return source;
        }
        let config = self.config.read().clone();
        let mut sources = self.sources.write();
        if let Some(source) = sources.iter().find(|s| s.endpoint == endpoint) {
            return Arc::clone(source);
        }
        let source = Arc::new(RemoteSource {
            endpoint,
            stream: Mutex::new(RemoteStream::new(endpoint, &config, now)),
        });
        sources.push(Arc::clone(&source));
        tracing::info!("Sink {}: new source {}", self.id, endpoint);
        events.push(StreamEvent::SourceAdd { endpoint });
        source
    }

    fn remove_source(&self, endpoint: Endpoint) -> bool {
        let mut sources = self.sources.write();
        let before = sources.len();
        sources.retain(|s| s.endpoint != endpoint);
        sources.len() != before
    }

    fn queue(&self, endpoint: Endpoint, message: StreamMessage) -> bool {
        self.outgoing.push(endpoint.addr, message.encode(endpoint.id))
    }

    /// True if data from `endpoint` must be refused; repeats the uninvitation
    fn refuse(&self, endpoint: Endpoint, now: f64) -> bool {
        let config = self.config.read();
        let mut uninvited = self.uninvited.lock();
        let Some(entry) = uninvited.iter_mut().find(|u| u.endpoint == endpoint) else {
            return false;
        };
        entry.until = now + config.invite_timeout_ms / 1000.0;
        if now - entry.last_sent >= config.resend_interval_ms / 1000.0 {
            entry.last_sent = now;
            drop(uninvited);
            if self.queue(endpoint, StreamMessage::Uninvite { sink_id: self.id }) {
                notify(&self.handle);
            }
        }
        true
    }

    fn invite(&self, endpoint: Endpoint) {
        let now = self.now();
        self.uninvited.lock().retain(|u| u.endpoint != endpoint);
        {
            let mut invites = self.invites.lock();
            if !invites.iter().any(|i| i.endpoint == endpoint) {
                invites.push(Invitation { endpoint, started: now, last_sent: now });
            }
        }
        tracing::info!("Sink {} inviting {}", self.id, endpoint);
        if self.queue(endpoint, StreamMessage::Invite { sink_id: self.id }) {
            notify(&self.handle);
        }
    }

    fn uninvite(&self, endpoint: Endpoint) {
        let now = self.now();
        let until = now + self.config.read().invite_timeout_ms / 1000.0;
        self.invites.lock().retain(|i| i.endpoint != endpoint);
        {
            let mut uninvited = self.uninvited.lock();
            uninvited.retain(|u| u.endpoint != endpoint);
            uninvited.push(Uninvited { endpoint, until, last_sent: now });
        }
        if self.remove_source(endpoint) {
            tracing::info!("Sink {} uninvited {}", self.id, endpoint);
            self.events.push(StreamEvent::SourceRemove { endpoint });
        }
        if self.queue(endpoint, StreamMessage::Uninvite { sink_id: self.id }) {
            notify(&self.handle);
        }
    }

    fn handle_message_at(&self, data: &[u8], from: SocketAddr, arrival: TimeTag) {
        let message = match StreamMessage::decode(data) {
            Ok((_, message)) => message,
            Err(e) => {
                tracing::debug!("Sink {}: dropping datagram from {}: {}", self.id, from, e);
                return;
            }
        };
        let now = arrival.to_seconds();
        let mut events = Vec::new();
        let mut queued = false;

        match message {
            StreamMessage::Format { source_id, stream_id, format } => {
                let endpoint = Endpoint::new(from, source_id);
                if self.refuse(endpoint, now) {
                    return;
                }
                self.invites.lock().retain(|i| i.endpoint != endpoint);
                let source = self.find_or_add(endpoint, now, &mut events);
                let config = self.config.read().clone();
                {
                    let mut stream = source.stream.lock();
                    stream.last_packet = now;
                    stream.set_format(stream_id, format, &config, &mut events);
                }
                tracing::debug!("Sink {}: {} streams {} as {}", self.id, endpoint, format, stream_id);
            }
            StreamMessage::Data(frame) => {
                let endpoint = Endpoint::new(from, frame.source_id);
                if self.refuse(endpoint, now) {
                    return;
                }
                self.invites.lock().retain(|i| i.endpoint != endpoint);
                let source = self.find_or_add(endpoint, now, &mut events);
                let interval = self.config.read().resend_interval_ms / 1000.0;
                let request_format = {
                    let mut stream = source.stream.lock();
                    stream.last_packet = now;
                    if stream.stream_id == Some(frame.stream_id) {
                        stream.insert(&frame, now, &mut events);
                        false
                    } else {
                        stream.wants_format(now, interval)
                    }
                };
                if request_format {
                    tracing::debug!("Sink {}: requesting format of stream {} from {}", self.id, frame.stream_id, endpoint);
                    queued |= self.queue(endpoint, StreamMessage::FormatRequest { sink_id: self.id });
                }
            }
            StreamMessage::Ping { source_id, sent } => {
                let endpoint = Endpoint::new(from, source_id);
                if let Some(source) = self.find(endpoint) {
                    let lost = {
                        let mut stream = source.stream.lock();
                        stream.last_packet = now;
                        std::mem::take(&mut stream.lost_since_ping)
                    };
                    let reply = StreamMessage::PingReply { sink_id: self.id, sent, received: arrival, lost };
                    queued |= self.queue(endpoint, reply);
                }
            }
            other => {
                tracing::debug!("Sink {}: unexpected message kind {} from {}", self.id, other.kind(), from);
            }
        }

        self.events.extend(events);
        if queued {
            notify(&self.handle);
        }
    }

    fn process(&self, outputs: &mut [&mut [f32]], now: TimeTag) -> Result<(), StreamError> {
        let setup = (*self.setup.read()).ok_or(StreamError::NotSetUp)?;
        if outputs.len() < setup.channels {
            return Err(StreamError::ChannelMismatch { expected: setup.channels, actual: outputs.len() });
        }
        for output in outputs.iter_mut() {
            output.fill(0.0);
        }
        let frames = outputs.first().map_or(0, |c| c.len());
        self.time.store(now.raw(), Ordering::Release);
        let t = now.to_seconds();
        let config = self.config.read().clone();

        let mut events = Vec::new();
        let mut requests = Vec::new();
        let mut expired = Vec::new();
        for source in self.sources.read().iter() {
            let mut stream = source.stream.lock();
            if t - stream.last_packet > config.source_timeout_ms / 1000.0 {
                expired.push(source.endpoint);
                continue;
            }
            if let Some(request) = stream.process(outputs, frames, t, &config, &mut events) {
                requests.push((source.endpoint, request));
            }
        }

        let mut queued = false;
        for (endpoint, (stream_id, sequences)) in requests {
            for chunk in sequences.chunks(MAX_RESEND_PER_REQUEST) {
                let request = StreamMessage::ResendRequest { sink_id: self.id, stream_id, sequences: chunk.to_vec() };
                queued |= self.queue(endpoint, request);
            }
        }

        for endpoint in expired {
            if self.remove_source(endpoint) {
                tracing::info!("Sink {}: source {} timed out", self.id, endpoint);
                events.push(StreamEvent::SourceRemove { endpoint });
            }
        }

        {
            let retry = config.resend_interval_ms * 10.0 / 1000.0;
            let timeout = config.invite_timeout_ms / 1000.0;
            let mut invites = self.invites.lock();
            invites.retain_mut(|invite| {
                if t - invite.started >= timeout {
                    tracing::warn!("Sink {}: invitation to {} timed out", self.id, invite.endpoint);
                    events.push(StreamEvent::InviteTimeout { endpoint: invite.endpoint });
                    return false;
                }
                if t - invite.last_sent >= retry {
                    invite.last_sent = t;
                    queued |= self.queue(invite.endpoint, StreamMessage::Invite { sink_id: self.id });
                }
                true
            });
        }
        self.uninvited.lock().retain(|u| u.until > t);

        self.events.extend(events);
        if queued {
            notify(&self.handle);
        }
        Ok(())
    }
}

impl NodeOwner for SinkInner {
    fn kind(&self) -> EndpointType {
        EndpointType::Sink
    }

    fn id(&self) -> i32 {
        self.id
    }

    fn handle_message(&self, data: &[u8], from: SocketAddr) {
        self.handle_message_at(data, from, TimeTag::now());
    }

    fn flush(&self, sink: &dyn PacketSink) {
        self.outgoing.flush(sink);
    }
}
