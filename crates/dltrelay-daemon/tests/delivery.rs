//! Delivery properties of the dispatcher, driven through its public API.

use std::sync::{Arc, Mutex};

use dltrelay_daemon::{
    Channel, ChannelError, DaemonConfig, DeliveryState, Dispatcher, OutputChannels,
    RingBufferConfig,
};
use dltrelay_frame::envelope::{RegisterApplication, RegisterContext};
use dltrelay_frame::{decode_message, Id4, Message, UserMessage};
use dltrelay_transport::{ConnectionId, ConnectionIds};

#[derive(Clone, Default)]
struct Capture {
    messages: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Capture {
    fn log_counters(&self) -> Vec<u8> {
        self.messages
            .lock()
            .expect("capture lock should not be poisoned")
            .iter()
            .map(|bytes| {
                decode_message(bytes)
                    .expect("delivered bytes should decode")
                    .expect("delivered bytes should be one whole message")
                    .0
            })
            .filter(|message| !message.is_control())
            .map(|message| message.counter)
            .collect()
    }
}

impl Channel for Capture {
    fn write_parts(&mut self, parts: &[&[u8]]) -> Result<(), ChannelError> {
        self.messages
            .lock()
            .expect("capture lock should not be poisoned")
            .push(parts.concat());
        Ok(())
    }
}

fn dispatcher(config: DaemonConfig) -> Dispatcher {
    let mut dispatcher = Dispatcher::new(config, Arc::new(OutputChannels::new()))
        .expect("dispatcher should build");
    assert_eq!(dispatcher.transports_ready(), DeliveryState::Buffer);
    dispatcher
}

fn log(counter: u8) -> Message {
    Message::log(Id4::new("APP"), Id4::new("CTX"), counter, vec![0xAB; 8])
}

#[test]
fn ordering_across_buffer_and_direct_delivery() {
    let ids = ConnectionIds::new();
    let mut dispatcher = dispatcher(DaemonConfig::default());
    for counter in 0..5 {
        dispatcher.on_producer_message(log(counter));
    }

    let consumer = Capture::default();
    dispatcher.consumer_connected(ids.next_id(), Box::new(consumer.clone()));
    for counter in 5..10 {
        dispatcher.on_producer_message(log(counter));
    }
    dispatcher.tick();

    assert_eq!(consumer.log_counters(), (0..10).collect::<Vec<u8>>());
}

struct Stalled;

impl Channel for Stalled {
    fn write_parts(&mut self, _parts: &[&[u8]]) -> Result<(), ChannelError> {
        Err(ChannelError::WouldBlock)
    }
}

#[test]
fn state_machine_cycle_with_three_buffered_messages() {
    let ids = ConnectionIds::new();
    let mut dispatcher = dispatcher(DaemonConfig::default());
    for counter in 0..3 {
        dispatcher.on_producer_message(log(counter));
    }
    assert_eq!(dispatcher.ring_buffer().message_count(), 3);

    let consumer = Capture::default();
    let id: ConnectionId = ids.next_id();
    dispatcher.consumer_connected(id, Box::new(consumer.clone()));
    // the flush on connect drains everything
    assert_eq!(dispatcher.state(), DeliveryState::SendDirect);
    assert!(dispatcher.ring_buffer().is_empty());
    assert_eq!(consumer.log_counters(), [0, 1, 2]);

    dispatcher.consumer_closed(id);
    assert_eq!(dispatcher.state(), DeliveryState::Buffer);
    assert!(dispatcher.outputs().is_empty());
}

#[test]
fn stalled_consumer_keeps_buffered_messages() {
    let ids = ConnectionIds::new();
    let mut dispatcher = dispatcher(DaemonConfig::default());
    for counter in 0..2 {
        dispatcher.on_producer_message(log(counter));
    }

    dispatcher.consumer_connected(ids.next_id(), Box::new(Stalled));
    assert_eq!(dispatcher.consumer_count(), 0, "stalled consumer is dropped");
    assert_eq!(dispatcher.state(), DeliveryState::Buffer);

    let consumer = Capture::default();
    dispatcher.consumer_connected(ids.next_id(), Box::new(consumer.clone()));
    assert_eq!(consumer.log_counters(), [0, 1], "nothing popped without a write");
}

#[test]
fn bounded_growth_counts_each_discard() {
    let config = RingBufferConfig {
        min_size: 1_000,
        max_size: 3_000,
        step_size: 1_000,
    };
    let mut dispatcher = dispatcher(DaemonConfig {
        ring_buffer: config,
        ..DaemonConfig::default()
    });

    let mut capacities = vec![dispatcher.ring_buffer().capacity()];
    while dispatcher.state() != DeliveryState::BufferFull {
        dispatcher.on_producer_message(log(0));
        let capacity = dispatcher.ring_buffer().capacity();
        assert!(capacity <= config.max_size);
        if capacities.last() != Some(&capacity) {
            capacities.push(capacity);
        }
    }
    assert_eq!(capacities, [1_000, 2_000, 3_000]);
    assert_eq!(dispatcher.overflow_counter(), 1);

    let stored = dispatcher.ring_buffer().message_count();
    for expected in 2..=6 {
        dispatcher.on_producer_message(log(0));
        assert_eq!(dispatcher.overflow_counter(), expected);
    }
    assert_eq!(dispatcher.ring_buffer().message_count(), stored);
}

#[test]
fn producer_stream_resync_yields_exactly_two_envelopes() {
    let ids = ConnectionIds::new();
    let mut dispatcher = dispatcher(DaemonConfig::default());
    let producer = ids.next_id();
    dispatcher.producer_connected(producer, Box::new(Capture::default()), Some(1));

    let mut stream = vec![0x00, 0x13, b'D', b'U', 0xFF, b'x'];
    let first = UserMessage::RegisterApplication(RegisterApplication {
        apid: Id4::new("APP"),
        pid: 1,
        description: "resync".to_string(),
    });
    let second = UserMessage::RegisterContext(RegisterContext {
        apid: Id4::new("APP"),
        ctid: Id4::new("CTX"),
        log_level_pos: 0,
        log_level: 2,
        trace_status: 0,
        pid: 1,
        description: String::new(),
    });
    for message in [&first, &second] {
        stream.extend_from_slice(&message.to_bytes().expect("envelope should encode"));
    }
    dispatcher.on_producer_bytes(producer, &stream);

    let list = dispatcher
        .registry()
        .find_user_list(Id4::new("ECU1"))
        .expect("user list should exist");
    assert_eq!(list.applications().len(), 1);
    assert_eq!(list.contexts().len(), 1);
    assert_eq!(list.applications()[0].context_count, 1);
    assert_eq!(list.contexts()[0].log_level, 2);
}

#[test]
fn duplicate_context_registration_updates_in_place() {
    let ids = ConnectionIds::new();
    let mut dispatcher = dispatcher(DaemonConfig::default());
    let producer = ids.next_id();
    dispatcher.producer_connected(producer, Box::new(Capture::default()), Some(1));
    dispatcher.on_user_message(
        producer,
        UserMessage::RegisterApplication(RegisterApplication {
            apid: Id4::new("APP"),
            pid: 1,
            description: String::new(),
        }),
    );
    for (ctid, level) in [("ONE", 2), ("ONE", 5), ("TWO", 3), ("BAD", 42)] {
        dispatcher.on_user_message(
            producer,
            UserMessage::RegisterContext(RegisterContext {
                apid: Id4::new("APP"),
                ctid: Id4::new(ctid),
                log_level_pos: 0,
                log_level: level,
                trace_status: 0,
                pid: 1,
                description: String::new(),
            }),
        );
    }

    let list = dispatcher
        .registry()
        .find_user_list(Id4::new("ECU1"))
        .expect("user list should exist");
    assert_eq!(list.contexts().len(), 2);
    assert_eq!(list.applications()[0].context_count, 2);
    let one = dispatcher
        .registry()
        .find_context(Id4::new("ECU1"), Id4::new("APP"), Id4::new("ONE"))
        .expect("context should exist");
    assert_eq!(one.log_level, 5);
}
