//! The dispatcher: turns bytes arriving from producers and consumers into
//! registry updates and delivered messages.
//!
//! One thread owns a [`Dispatcher`]. The registry, the ring buffer and the
//! delivery state are only ever touched through `&mut self`; the consumer
//! channels sit behind the [`OutputChannels`] mutex so helper threads can
//! share them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dltrelay_frame::envelope::LogLevelUpdate;
use dltrelay_frame::header::msin;
use dltrelay_frame::service;
use dltrelay_frame::{
    decode_message, decode_user_message, find_control_marker, find_serial_header, Id4, Message,
    Receiver, StorageHeader, UserMessage, USER_HEADER_PATTERN,
};
use dltrelay_transport::ConnectionId;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};
use crate::output::{Channel, ChannelError, OutputChannels, TraceOutput, TraceSink};
use crate::persist::{LoggingMode, RuntimeStore};
use crate::registry::{ContextRegistration, Registry, LOG_LEVEL_DEFAULT, TRACE_STATUS_DEFAULT};
use crate::ring_buffer::RingBuffer;
use crate::state::{DeliveryState, DeliveryStateMachine};

/// Application id of daemon-generated control messages.
pub const CONTROL_APID: Id4 = Id4::from_bytes(*b"DA1\0");
/// Context id of daemon-generated control messages.
pub const CONTROL_CTID: Id4 = Id4::from_bytes(*b"DC1\0");

const TIMING_PERIOD: Duration = Duration::from_secs(1);
const METADATA_PERIOD: Duration = Duration::from_secs(60);

/// Who a message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Every consumer, or the ring buffer while buffering.
    ToAll,
    /// Every consumer right now, whatever the delivery state.
    Force,
    /// One consumer only.
    To(ConnectionId),
}

struct ProducerLink {
    /// Write half; `None` once released or found closed.
    channel: Option<Box<dyn Channel>>,
    receiver: Receiver,
    pid: Option<u32>,
}

pub struct Dispatcher {
    pub(crate) config: DaemonConfig,
    pub(crate) registry: Registry,
    ring_buffer: RingBuffer,
    state: DeliveryStateMachine,
    outputs: Arc<OutputChannels>,
    producers: HashMap<ConnectionId, ProducerLink>,
    consumers: HashMap<ConnectionId, Receiver>,
    trace: Option<TraceOutput>,
    pub(crate) store: Option<RuntimeStore>,
    overflow_counter: u32,
    logging_mode: LoggingMode,
    pub(crate) timing_packets: bool,
    started: Instant,
    last_timing: Instant,
    last_metadata: Instant,
    dead_consumers: Vec<ConnectionId>,
}

impl Dispatcher {
    /// Build a dispatcher in `INIT`.
    ///
    /// Fails only when the ring buffer limits are unusable. Runtime files
    /// that cannot be read are logged and skipped.
    pub fn new(config: DaemonConfig, outputs: Arc<OutputChannels>) -> Result<Self> {
        let ring_buffer = RingBuffer::new(config.ring_buffer)?;
        let mut registry = Registry::new(config.registry_settings());
        let store = config.runtime_directory.as_ref().map(RuntimeStore::new);
        let mut logging_mode = LoggingMode::default();

        if let Some(store) = &store {
            match store.load(&mut registry, config.ecu_id) {
                Ok(loaded) => debug!(dir = ?store.dir(), loaded, "runtime configuration read"),
                Err(err) => warn!(error = %err, "ignoring runtime configuration"),
            }
            match store.load_logging_mode() {
                Ok(Some(mode)) => logging_mode = mode,
                Ok(None) => {}
                Err(err) => warn!(error = %err, "ignoring stored logging mode"),
            }
        }

        let now = Instant::now();
        Ok(Self {
            timing_packets: config.timing_packets,
            config,
            registry,
            ring_buffer,
            state: DeliveryStateMachine::new(),
            outputs,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            trace: None,
            store,
            overflow_counter: 0,
            logging_mode,
            started: now,
            last_timing: now,
            last_metadata: now,
            dead_consumers: Vec::new(),
        })
    }

    /// Also write every message sent to all consumers to `sink`.
    pub fn with_trace_sink(mut self, sink: Box<dyn TraceSink>) -> Self {
        self.trace = Some(TraceOutput::new(sink));
        self
    }

    /// Listeners are up; leave `INIT`.
    pub fn transports_ready(&mut self) -> DeliveryState {
        self.state.transports_ready(self.config.serial_consumer)
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn state(&self) -> DeliveryState {
        self.state.state()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn ring_buffer(&self) -> &RingBuffer {
        &self.ring_buffer
    }

    /// Messages discarded since the last overflow notice went out.
    pub fn overflow_counter(&self) -> u32 {
        self.overflow_counter
    }

    pub fn logging_mode(&self) -> LoggingMode {
        self.logging_mode
    }

    pub fn consumer_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn outputs(&self) -> &Arc<OutputChannels> {
        &self.outputs
    }

    // ---- producers ------------------------------------------------------

    pub fn producer_connected(
        &mut self,
        id: ConnectionId,
        channel: Box<dyn Channel>,
        pid: Option<u32>,
    ) {
        info!(producer = %id, pid = ?pid, "producer connected");
        self.producers.insert(
            id,
            ProducerLink {
                channel: Some(channel),
                receiver: Receiver::new(),
                pid,
            },
        );
    }

    /// The producer connection is gone; nothing may write to it again.
    pub fn producer_closed(&mut self, id: ConnectionId) {
        let Some(link) = self.producers.remove(&id) else {
            return;
        };
        let entries = self.registry.invalidate_channel(self.config.ecu_id, id);
        info!(producer = %id, pid = ?link.pid, entries, "producer disconnected");
    }

    /// Feed bytes read from a producer connection.
    ///
    /// Everything before the next envelope marker is dropped. Decoding stops
    /// at an incomplete envelope; the rest waits for more bytes.
    pub fn on_producer_bytes(&mut self, id: ConnectionId, bytes: &[u8]) {
        match self.producers.get_mut(&id) {
            Some(link) => link.receiver.extend_from_slice(bytes),
            None => {
                warn!(producer = %id, "bytes from unknown producer");
                return;
            }
        }

        loop {
            let Some(link) = self.producers.get_mut(&id) else {
                break;
            };
            let receiver = &mut link.receiver;
            let Some(offset) = find_control_marker(receiver.as_slice()) else {
                // a marker may be split across reads
                let keep = USER_HEADER_PATTERN.len() - 1;
                let dropped = receiver.bytes_received().saturating_sub(keep);
                if dropped > 0 {
                    debug!(producer = %id, dropped, "no envelope marker, dropping bytes");
                }
                receiver.remove(dropped);
                break;
            };
            if offset > 0 {
                debug!(producer = %id, dropped = offset, "resynchronized producer stream");
                receiver.remove(offset);
            }
            match decode_user_message(receiver.as_slice()) {
                Ok(Some((message, used))) => {
                    receiver.remove(used);
                    self.on_user_message(id, message);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(producer = %id, error = %err, "dropping malformed envelope");
                    receiver.remove(USER_HEADER_PATTERN.len());
                }
            }
        }

        if let Some(link) = self.producers.get_mut(&id) {
            link.receiver.move_to_begin();
        }
        self.reap_consumers();
    }

    /// Act on one decoded producer envelope.
    pub fn on_user_message(&mut self, source: ConnectionId, message: UserMessage) {
        let ecu = self.config.ecu_id;
        match message {
            UserMessage::Log(message) => self.on_producer_message(message),
            UserMessage::RegisterApplication(request) => {
                let pid = u32::try_from(request.pid).unwrap_or(0);
                match self.registry.add_application(
                    ecu,
                    request.apid,
                    pid,
                    &request.description,
                    Some(source),
                ) {
                    Ok(app) => info!(apid = %app.apid, pid, "registered application"),
                    Err(err) => warn!(apid = %request.apid, error = %err, "application not registered"),
                }
                self.release_channels();
                self.push_log_state(request.apid);
            }
            UserMessage::UnregisterApplication { apid, pid } => {
                match self.registry.remove_application_with_contexts(ecu, apid) {
                    Ok(_) => info!(apid = %apid, pid, "unregistered application"),
                    Err(err) => warn!(apid = %apid, error = %err, "application not unregistered"),
                }
                self.release_channels();
            }
            UserMessage::RegisterContext(request) => self.register_context(request),
            UserMessage::UnregisterContext { apid, ctid, pid } => {
                match self.registry.remove_context(ecu, apid, ctid) {
                    Ok(_) => {
                        info!(apid = %apid, ctid = %ctid, pid, "unregistered context");
                        let notice = service::encode_unregister_context(apid, ctid);
                        if let Err(err) = self.send_control(SendMode::ToAll, notice) {
                            debug!(error = %err, "unregister notice not sent");
                        }
                    }
                    Err(err) => {
                        warn!(apid = %apid, ctid = %ctid, error = %err, "context not unregistered")
                    }
                }
            }
            UserMessage::Overflow {
                overflow_counter,
                apid,
            } => {
                if self.send_overflow_notice(overflow_counter, apid).is_err() {
                    self.overflow_counter = self.overflow_counter.saturating_add(overflow_counter);
                }
            }
            UserMessage::AppLogLevelTraceStatus {
                apid,
                log_level,
                trace_status,
            } => self.set_application_levels(apid, log_level, trace_status),
            UserMessage::LogMode(value) => match LoggingMode::from_i8(value) {
                Some(mode) => self.set_logging_mode(mode),
                None => warn!(value, "invalid logging mode"),
            },
            UserMessage::Marker => {
                if let Err(err) = self.send_control(SendMode::ToAll, service::encode_marker()) {
                    debug!(error = %err, "marker not sent");
                }
            }
            UserMessage::LogShm
            | UserMessage::LogLevel(_)
            | UserMessage::Injection(_)
            | UserMessage::LogState(_) => {
                debug!(producer = %source, kind = message.message_type(), "ignoring envelope");
            }
            UserMessage::Unsupported(kind) => {
                debug!(producer = %source, kind, "unsupported envelope type");
            }
        }
        self.reap_consumers();
    }

    /// Deliver one producer log message.
    pub fn on_producer_message(&mut self, mut message: Message) {
        if self.logging_mode == LoggingMode::Off {
            return;
        }
        let ecu = self.config.ecu_id;
        message.storage = StorageHeader::now(ecu);
        if !self.config.stamp_ecu_id {
            message.set_storage_ecu(ecu);
        }

        if self.overflow_counter > 0 {
            let discarded = self.overflow_counter;
            if self.send_overflow_notice(discarded, Id4::EMPTY).is_ok() {
                warn!(discarded, "messages discarded while the ring buffer was full");
                self.overflow_counter = 0;
            }
        }

        match self.send_message(SendMode::ToAll, &message) {
            Ok(()) => {}
            Err(DaemonError::BufferFull) => {
                self.overflow_counter = self.overflow_counter.saturating_add(1);
                debug!(counter = self.overflow_counter, "log message discarded");
            }
            Err(err) => debug!(error = %err, "log message not delivered"),
        }
        self.reap_consumers();
    }

    fn register_context(&mut self, request: dltrelay_frame::RegisterContext) {
        let ecu = self.config.ecu_id;
        let channel = self
            .registry
            .find_application(ecu, request.apid)
            .and_then(|app| app.channel);
        let registration = ContextRegistration {
            apid: request.apid,
            ctid: request.ctid,
            log_level: request.log_level,
            trace_status: request.trace_status,
            log_level_pos: request.log_level_pos,
            channel,
            description: request.description,
        };
        match self.registry.add_context(ecu, registration) {
            Ok(ctx) => info!(
                apid = %ctx.apid,
                ctid = %ctx.ctid,
                log_level = ctx.log_level,
                trace_status = ctx.trace_status,
                "registered context"
            ),
            Err(err) => {
                warn!(apid = %request.apid, ctid = %request.ctid, error = %err, "context not registered");
                return;
            }
        }

        if self.config.auto_log_info {
            let option = self.config.auto_log_info_option;
            let payload =
                service::encode_log_info(option, &self.collect_log_info(request.apid, request.ctid));
            if let Err(err) = self.send_control(SendMode::ToAll, payload) {
                debug!(error = %err, "log info not sent");
            }
        }
        if request.log_level == LOG_LEVEL_DEFAULT || request.trace_status == TRACE_STATUS_DEFAULT {
            self.push_log_level(request.apid, request.ctid);
        }
        self.push_log_state(request.apid);
    }

    fn set_application_levels(&mut self, apid: Id4, log_level: i8, trace_status: i8) {
        let ecu = self.config.ecu_id;
        let ctids: Vec<Id4> = self
            .registry
            .contexts_of(ecu, apid)
            .iter()
            .map(|ctx| ctx.ctid)
            .collect();
        for ctid in ctids {
            let level = self.registry.set_context_level(ecu, apid, ctid, log_level);
            let status = self
                .registry
                .set_context_status(ecu, apid, ctid, trace_status);
            if let Err(err) = level.and(status) {
                warn!(apid = %apid, ctid = %ctid, error = %err, "levels not applied");
                continue;
            }
            self.push_log_level(apid, ctid);
        }
    }

    pub(crate) fn set_logging_mode(&mut self, mode: LoggingMode) {
        info!(mode = mode.as_i8(), "logging mode changed");
        self.logging_mode = mode;
        if let Some(store) = &self.store {
            if let Err(err) = store.save_logging_mode(mode) {
                warn!(error = %err, "logging mode not persisted");
            }
        }
    }

    /// Drop the write half of producer links nothing refers to anymore.
    fn release_channels(&mut self) {
        let ecu = self.config.ecu_id;
        for id in self.registry.take_released() {
            if self.registry.references_channel(ecu, id) {
                continue;
            }
            if let Some(link) = self.producers.get_mut(&id) {
                if link.channel.take().is_some() {
                    debug!(producer = %id, "released producer channel");
                }
            }
        }
    }

    pub(crate) fn write_producer(&mut self, id: ConnectionId, message: &UserMessage) -> bool {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "envelope not encoded");
                return false;
            }
        };
        let Some(channel) = self
            .producers
            .get_mut(&id)
            .and_then(|link| link.channel.as_mut())
        else {
            return false;
        };
        match channel.write_parts(&[&bytes]) {
            Ok(()) => true,
            Err(ChannelError::WouldBlock) => {
                warn!(producer = %id, "producer is not reading");
                false
            }
            Err(ChannelError::Closed) => {
                info!(producer = %id, "producer channel closed");
                if let Some(link) = self.producers.get_mut(&id) {
                    link.channel = None;
                }
                self.registry.invalidate_channel(self.config.ecu_id, id);
                false
            }
        }
    }

    /// Push a context's effective level and status to its producer.
    pub(crate) fn push_log_level(&mut self, apid: Id4, ctid: Id4) -> bool {
        let settings = *self.registry.settings();
        let Some(ctx) = self.registry.find_context(self.config.ecu_id, apid, ctid) else {
            return false;
        };
        let Some(channel) = ctx.channel else {
            debug!(apid = %apid, ctid = %ctid, "context has no producer channel");
            return false;
        };
        let update = LogLevelUpdate {
            log_level: ctx.effective_log_level(&settings) as u8,
            trace_status: ctx.effective_trace_status(&settings) as u8,
            log_level_pos: ctx.log_level_pos,
        };
        debug!(apid = %apid, ctid = %ctid, log_level = update.log_level, "pushing log level");
        self.write_producer(channel, &UserMessage::LogLevel(update))
    }

    /// Push the new defaults to every context still at "default".
    pub(crate) fn push_default_update(&mut self) {
        let targets: Vec<(Id4, Id4)> = self
            .registry
            .find_user_list(self.config.ecu_id)
            .map(|list| {
                list.contexts()
                    .iter()
                    .filter(|ctx| {
                        ctx.log_level == LOG_LEVEL_DEFAULT
                            || ctx.trace_status == TRACE_STATUS_DEFAULT
                    })
                    .map(|ctx| (ctx.apid, ctx.ctid))
                    .collect()
            })
            .unwrap_or_default();
        for (apid, ctid) in targets {
            self.push_log_level(apid, ctid);
        }
    }

    fn log_state(&self) -> i8 {
        i8::from(!self.outputs.is_empty())
    }

    fn push_log_state(&mut self, apid: Id4) {
        let state = self.log_state();
        if let Some(channel) = self
            .registry
            .find_application(self.config.ecu_id, apid)
            .and_then(|app| app.channel)
        {
            self.write_producer(channel, &UserMessage::LogState(state));
        }
    }

    fn push_log_state_all(&mut self, state: i8) {
        let mut channels: Vec<ConnectionId> = self
            .registry
            .find_user_list(self.config.ecu_id)
            .map(|list| {
                list.applications()
                    .iter()
                    .filter_map(|app| app.channel)
                    .collect()
            })
            .unwrap_or_default();
        channels.sort_unstable();
        channels.dedup();
        for channel in channels {
            self.write_producer(channel, &UserMessage::LogState(state));
        }
    }

    // ---- consumers ------------------------------------------------------

    /// Attach a consumer. `channel` must already carry the send timeout.
    pub fn consumer_connected(&mut self, id: ConnectionId, channel: Box<dyn Channel>) {
        let count = self.outputs.add(id, channel);
        self.consumers.insert(id, Receiver::new());
        info!(consumer = %id, consumers = count, "consumer connected");

        let info = service::encode_connection_info(service::CONNECTION_CONNECTED);
        if let Err(err) = self.send_control(SendMode::To(id), info) {
            debug!(consumer = %id, error = %err, "connection info not sent");
        }
        self.send_metadata(SendMode::To(id));

        if count == 1 {
            self.state.consumer_connected(self.ring_buffer.is_empty());
            self.flush();
            self.push_log_state_all(1);
        }
        self.reap_consumers();
    }

    pub fn consumer_closed(&mut self, id: ConnectionId) {
        self.close_consumer(id);
        self.reap_consumers();
    }

    fn close_consumer(&mut self, id: ConnectionId) {
        self.consumers.remove(&id);
        if !self.outputs.remove(id) {
            return;
        }
        let remaining = self.outputs.len();
        info!(consumer = %id, consumers = remaining, "consumer disconnected");
        if remaining == 0 {
            self.state.last_consumer_closed(self.trace.is_some());
            self.push_log_state_all(0);
        }
        let info = service::encode_connection_info(service::CONNECTION_DISCONNECTED);
        if let Err(err) = self.send_control(SendMode::ToAll, info) {
            debug!(error = %err, "disconnect notice not sent");
        }
    }

    /// Close every consumer a write failed on.
    fn reap_consumers(&mut self) {
        while let Some(id) = self.dead_consumers.pop() {
            self.close_consumer(id);
        }
    }

    /// Feed bytes read from a consumer connection and answer the control
    /// requests they complete.
    pub fn on_consumer_bytes(&mut self, id: ConnectionId, bytes: &[u8]) {
        let Some(receiver) = self.consumers.get_mut(&id) else {
            warn!(consumer = %id, "bytes from unknown consumer");
            return;
        };
        receiver.extend_from_slice(bytes);

        let mut requests = Vec::new();
        loop {
            match decode_message(receiver.as_slice()) {
                Ok(Some((message, used))) => {
                    receiver.remove(used);
                    requests.push(message);
                }
                Ok(None) => break,
                Err(err) => {
                    let buffered = receiver.bytes_received();
                    let skip = receiver
                        .as_slice()
                        .get(1..)
                        .and_then(find_serial_header)
                        .map_or(buffered, |offset| offset + 1);
                    warn!(consumer = %id, error = %err, dropped = skip, "malformed consumer message");
                    receiver.remove(skip);
                }
            }
        }
        receiver.move_to_begin();

        for request in requests {
            self.on_control_request(id, &request);
        }
        self.reap_consumers();
    }

    // ---- sending --------------------------------------------------------

    /// Send one message given as network header and payload; a fresh storage
    /// header is used for the trace sink.
    pub fn send(&mut self, mode: SendMode, header: &[u8], payload: &[u8]) -> Result<()> {
        let mut storage = BytesMut::new();
        StorageHeader::now(self.config.ecu_id).encode(&mut storage);
        self.send_parts(mode, &storage, header, payload)
    }

    pub fn send_message(&mut self, mode: SendMode, message: &Message) -> Result<()> {
        let mut header = BytesMut::with_capacity(message.header_size());
        message.encode_header(&mut header)?;
        let mut storage = BytesMut::new();
        message.storage.encode(&mut storage);
        self.send_parts(mode, &storage, &header, &message.payload)
    }

    fn send_parts(
        &mut self,
        mode: SendMode,
        storage: &[u8],
        header: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        if let SendMode::To(id) = mode {
            return self.outputs.write_to(id, &[header, payload]).map_err(|err| {
                if err != ChannelError::Closed || self.outputs.contains(id) {
                    self.dead_consumers.push(id);
                }
                DaemonError::SendFailed
            });
        }

        if mode == SendMode::ToAll && self.logging_mode.to_trace() {
            if let Some(trace) = &mut self.trace {
                trace.write(&[storage, header].concat(), payload);
            }
        }

        let state = self.state.state();
        if self.logging_mode.to_consumers()
            && (mode == SendMode::Force || state == DeliveryState::SendDirect)
        {
            let report = self.outputs.write_all(&[header, payload]);
            self.dead_consumers.extend(report.failed);
            if report.delivered == 0 && (mode == SendMode::Force || !self.config.logging_disabled_ok)
            {
                return Err(DaemonError::SendFailed);
            }
        }

        if mode == SendMode::ToAll
            && state.is_buffering()
            && self.ring_buffer.push_parts(&[header, payload]).is_err()
        {
            self.state.buffer_overflowed();
            return Err(DaemonError::BufferFull);
        }
        Ok(())
    }

    /// Build a control response from the daemon and send it.
    pub(crate) fn send_control(&mut self, mode: SendMode, payload: Bytes) -> Result<()> {
        let message = Message::control(
            self.config.ecu_id,
            self.uptime(),
            msin::RESPONSE,
            CONTROL_APID,
            CONTROL_CTID,
            payload,
        );
        self.send_message(mode, &message)
    }

    fn send_overflow_notice(&mut self, counter: u32, apid: Id4) -> Result<()> {
        let apid = if apid.is_empty() { CONTROL_APID } else { apid };
        let message = Message::control(
            self.config.ecu_id,
            self.uptime(),
            msin::RESPONSE,
            apid,
            CONTROL_CTID,
            service::encode_buffer_overflow(true, counter),
        );
        self.send_message(SendMode::ToAll, &message)
    }

    /// Software version and timezone, each when enabled.
    fn send_metadata(&mut self, mode: SendMode) {
        if self.config.send_software_version {
            let version = service::encode_software_version(&self.config.software_version);
            if let Err(err) = self.send_control(mode, version) {
                debug!(?mode, error = %err, "software version not sent");
            }
        }
        if self.config.send_timezone {
            let (offset, is_dst) = local_timezone();
            let timezone = service::encode_timezone(offset, is_dst);
            if let Err(err) = self.send_control(mode, timezone) {
                debug!(?mode, error = %err, "timezone not sent");
            }
        }
    }

    fn send_timing_packet(&mut self) {
        let mut message = Message::control(
            self.config.ecu_id,
            self.uptime(),
            msin::TIME,
            Id4::EMPTY,
            Id4::EMPTY,
            Bytes::new(),
        );
        if let Some(extended) = message.extended.as_mut() {
            extended.noar = 0;
        }
        if let Err(err) = self.send_message(SendMode::ToAll, &message) {
            debug!(error = %err, "timing packet not sent");
        }
    }

    /// Uptime in 0.1 ms ticks.
    fn uptime(&self) -> u32 {
        (self.started.elapsed().as_micros() / 100) as u32
    }

    // ---- periodic work --------------------------------------------------

    /// Replay buffered messages to the consumers.
    ///
    /// A message is popped only once at least one consumer took it. Stops at
    /// the first message nobody took; the rest stays for the next call.
    pub fn flush(&mut self) {
        while self.state.state().is_flushing() {
            let Some(message) = self.ring_buffer.front().cloned() else {
                break;
            };
            let report = self.outputs.write_all(&[&message]);
            let failed = !report.failed.is_empty();
            self.dead_consumers.extend(report.failed);
            if report.delivered == 0 {
                break;
            }
            self.ring_buffer.pop_front();
            self.state.flush_resumed();
            if failed {
                self.reap_consumers();
            }
        }

        if self.ring_buffer.is_empty() && self.state.state() == DeliveryState::SendBuffer {
            self.state.buffer_drained();
            self.ring_buffer.minimize();
        }
        self.reap_consumers();
    }

    /// Periodic tick: flush, then the timing packet and the metadata
    /// resend when they are due.
    pub fn tick(&mut self) {
        self.flush();
        if (self.config.send_software_version || self.config.send_timezone)
            && self.last_metadata.elapsed() >= METADATA_PERIOD
        {
            self.last_metadata = Instant::now();
            self.send_metadata(SendMode::ToAll);
        }
        if self.timing_packets
            && self.state.state() == DeliveryState::SendDirect
            && self.last_timing.elapsed() >= TIMING_PERIOD
        {
            self.last_timing = Instant::now();
            self.send_timing_packet();
        }
        self.reap_consumers();
    }
}

/// UTC offset of the local timezone in seconds.
fn local_timezone() -> (i32, bool) {
    let offset = chrono::Local::now().offset().local_minus_utc();
    // chrono exposes no DST flag
    (offset, false)
}
