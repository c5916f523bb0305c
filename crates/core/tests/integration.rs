//! Integration tests: sender → UDP loopback → receiver, and concurrent
//! access to the assembler.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use vidlink::assembler::{AssemblyScheduler, InsertOutcome};
use vidlink::packet::Fragmenter;
use vidlink::transport::udp::{bind_receiver, bind_sender};
use vidlink::{
    Frame, FrameAssembler, FrameOutcome, PassthroughEncoder, StreamConfig, StreamReceiver,
    StreamSender, TestPatternSource,
};

fn collect_frames(receiver: &StreamReceiver) -> Arc<Mutex<Vec<Frame>>> {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    receiver.add_subscriber(Arc::new(move |frame: &Frame| {
        sink.lock().push(frame.clone());
    }));
    frames
}

fn wait_for(frames: &Mutex<Vec<Frame>>, count: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while frames.lock().len() < count && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn sender_to_receiver_over_loopback() {
    let config = StreamConfig {
        fps: 50,
        receive_timeout: Duration::from_millis(20),
        packet_ttl: Duration::from_secs(1),
        ..StreamConfig::default()
    };

    let rx_socket = bind_receiver("127.0.0.1:0", &config).unwrap();
    let dest = rx_socket.local_addr().unwrap();
    let mut receiver = StreamReceiver::new(config.clone()).unwrap();
    let frames = collect_frames(&receiver);
    receiver.start(rx_socket).unwrap();

    let source = TestPatternSource::with_size(4000, 50).limit(20);
    let expected: Vec<u8> = (0..4000).map(|i| (i % 251) as u8).collect();

    let mut sender = StreamSender::new(&config, dest).unwrap();
    sender
        .start(
            bind_sender("127.0.0.1:0").unwrap(),
            Box::new(source),
            Box::new(PassthroughEncoder),
        )
        .unwrap();
    sender.wait();

    wait_for(&frames, 20, Duration::from_secs(5));
    receiver.stop();

    let frames = frames.lock();
    assert_eq!(frames.len(), 20);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.timestamp, 1800 * (i as u32 + 1));
        assert_eq!(frame.data, expected);
    }

    let sent = sender.stats();
    let received = receiver.stats();
    assert_eq!(sent.frames, 20);
    assert_eq!(sent.packets_sent, 60);
    assert_eq!(received.ingress.received, 60);
    assert_eq!(received.assembler.completed, 20);
    assert_eq!(received.assembler.abandoned, 0);
    assert_eq!(receiver.assembler().pending(), 0);
}

#[test]
fn malformed_datagrams_do_not_disturb_the_stream() {
    let config = StreamConfig {
        fps: 50,
        receive_timeout: Duration::from_millis(20),
        packet_ttl: Duration::from_secs(1),
        ..StreamConfig::default()
    };
    let rx_socket = bind_receiver("127.0.0.1:0", &config).unwrap();
    let dest = rx_socket.local_addr().unwrap();
    let mut receiver = StreamReceiver::new(config).unwrap();
    let frames = collect_frames(&receiver);
    receiver.start(rx_socket).unwrap();

    let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut fragmenter = Fragmenter::new(96, 77, 200).unwrap();
    let data: Vec<u8> = (0..700u32).map(|i| (i * 7) as u8).collect();
    for (i, packet) in fragmenter.fragment(&data, 4500).into_iter().enumerate() {
        if i == 1 {
            tx.send_to(&[0x80, 0x60, 0x00], dest).unwrap();
        }
        tx.send_to(&packet.to_bytes(), dest).unwrap();
    }

    wait_for(&frames, 1, Duration::from_secs(3));
    receiver.stop();

    assert_eq!(frames.lock().len(), 1);
    assert_eq!(frames.lock()[0].data, data);
    let stats = receiver.stats();
    assert_eq!(stats.ingress.malformed, 1);
    assert_eq!(stats.ingress.received, 4);
}

#[test]
fn concurrent_resolvers_deliver_each_frame_once() {
    const PRODUCERS: u32 = 4;
    const FRAMES_PER_PRODUCER: u32 = 50;
    const RESOLVERS: usize = 4;

    let assembler = Arc::new(FrameAssembler::with_frame_interval(Duration::from_millis(10)));
    let delivered = Arc::new(Mutex::new(HashMap::<u32, usize>::new()));
    {
        let delivered = delivered.clone();
        assembler.add_subscriber(Arc::new(move |frame: &Frame| {
            *delivered.lock().entry(frame.timestamp).or_default() += 1;
        }));
    }

    let frame_bytes = |ts: u32| -> Vec<u8> { (0..600u32).map(|i| (i ^ ts) as u8).collect() };

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let assembler = assembler.clone();
            thread::spawn(move || {
                let mut fragmenter = Fragmenter::new(96, 5, 212).unwrap().starting_at((p * 1000) as u16);
                for n in 0..FRAMES_PER_PRODUCER {
                    let ts = (n * PRODUCERS + p + 1) * 3000;
                    let mut packets = fragmenter.fragment(&frame_bytes(ts), ts);
                    packets.reverse();
                    for packet in packets {
                        assert_ne!(assembler.insert(packet), InsertOutcome::Late);
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let total = (PRODUCERS * FRAMES_PER_PRODUCER) as usize;
    assert_eq!(assembler.pending(), total);

    let timestamps: Vec<u32> = (1..=PRODUCERS * FRAMES_PER_PRODUCER).map(|k| k * 3000).collect();
    let completed = Arc::new(Mutex::new(Vec::new()));
    let resolvers: Vec<_> = (0..RESOLVERS)
        .map(|r| {
            let assembler = assembler.clone();
            let completed = completed.clone();
            let mut order = timestamps.clone();
            order.rotate_left(r * 37);
            thread::spawn(move || {
                for ts in order {
                    if let FrameOutcome::Completed { frame, concealed } = assembler.resolve(ts) {
                        assert_eq!(concealed, 0);
                        completed.lock().push(frame);
                    }
                }
            })
        })
        .collect();
    for resolver in resolvers {
        resolver.join().unwrap();
    }

    let completed = completed.lock();
    assert_eq!(completed.len(), total);
    for frame in completed.iter() {
        assert_eq!(frame.data, frame_bytes(frame.timestamp));
    }
    let delivered = delivered.lock();
    assert_eq!(delivered.len(), total);
    assert!(delivered.values().all(|&n| n == 1));
    assert_eq!(assembler.pending(), 0);
    assert_eq!(assembler.tracked_arrivals(), 0);
    assert_eq!(assembler.stats().completed, total as u64);
}

#[test]
fn scheduler_delivers_concurrent_inserts_exactly_once_in_order() {
    const PRODUCERS: usize = 4;
    const FRAMES: u32 = 60;
    const FRAME_LEN: usize = 800;

    let frame_bytes =
        |ts: u32| -> Vec<u8> { (0..FRAME_LEN as u32).map(|i| (i ^ (ts >> 3)) as u8).collect() };

    // Short enough that ticks and resolutions interleave with the inserts.
    let assembler = Arc::new(FrameAssembler::with_frame_interval(Duration::from_millis(10)));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    {
        let delivered = delivered.clone();
        assembler.add_subscriber(Arc::new(move |frame: &Frame| {
            delivered.lock().push(frame.clone());
        }));
    }
    let mut scheduler = AssemblyScheduler::start(assembler.clone()).unwrap();

    // Each frame's fragments are split across every producer, which move
    // from frame to frame in lockstep.
    let barrier = Arc::new(Barrier::new(PRODUCERS));
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let assembler = assembler.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                for n in 0..FRAMES {
                    let ts = (n + 1) * 1500;
                    let packets = Fragmenter::new(96, 7, 112)
                        .unwrap()
                        .starting_at((n * 8) as u16)
                        .fragment(&frame_bytes(ts), ts);
                    assert_eq!(packets.len(), 8);
                    barrier.wait();
                    for (i, packet) in packets.into_iter().enumerate() {
                        if i % PRODUCERS == p {
                            assert_ne!(assembler.insert(packet), InsertOutcome::Late);
                        }
                    }
                    barrier.wait();
                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let total = FRAMES as usize;
    let deadline = Instant::now() + Duration::from_secs(5);
    while delivered.lock().len() < total && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    scheduler.stop();

    let delivered = delivered.lock();
    let timestamps: Vec<u32> = delivered.iter().map(|f| f.timestamp).collect();
    let expected: Vec<u32> = (1..=FRAMES).map(|k| k * 1500).collect();
    assert_eq!(timestamps, expected);
    for frame in delivered.iter() {
        assert_eq!(frame.data, frame_bytes(frame.timestamp));
    }
    let stats = assembler.stats();
    assert_eq!(stats.completed, FRAMES as u64);
    assert_eq!(stats.late_packets, 0);
    assert_eq!(stats.abandoned, 0);
    assert_eq!(stats.concealed, 0);
    assert_eq!(assembler.pending(), 0);
}
