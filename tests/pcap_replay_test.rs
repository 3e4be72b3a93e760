//! Capture replay: dialect decoding, delivery counts, pacing, rewind,
//! stepping, and the silent-drop policy.

mod common;

use common::{
    legacy_pcap, pcapng, sll_udp_frame, udp_frame, Delivery, LegacyPacket, NgPacket, TempCapture,
    DLT_ETHERNET, DLT_LINUX_SLL,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use udpflow::{Error, PcapConfig, PcapReplayer, Reactor, ReplayMode};

const PORT: u16 = 9000;

fn collector() -> (Rc<RefCell<Vec<Delivery>>>, udpflow::PacketHandler) {
    let received: Rc<RefCell<Vec<Delivery>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    let handler: udpflow::PacketHandler = Box::new(move |payload, status, ts| {
        sink.borrow_mut().push((payload.to_vec(), status, ts));
    });
    (received, handler)
}

fn flood_config() -> PcapConfig {
    PcapConfig {
        mode: ReplayMode::Flood,
        ..PcapConfig::default()
    }
}

/// Runs the reactor until the replayer reports completion.
fn replay_to_end(reactor: &Rc<Reactor>, replayer: &PcapReplayer) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !replayer.is_finished() && Instant::now() < deadline {
        reactor.run_once(10).unwrap();
    }
    assert!(replayer.is_finished(), "replay did not finish in time");
}

#[test]
fn flood_delivers_every_packet_once() {
    let packets: Vec<LegacyPacket> = (0..50u32)
        .map(|i| {
            LegacyPacket::new(
                100,
                i * 10,
                udp_frame(PORT, format!("payload {i}").as_bytes()),
            )
        })
        .collect();
    let capture = TempCapture::write(
        "flood",
        &legacy_pcap(false, false, DLT_ETHERNET, &packets),
    );

    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
    replayer.open(&capture.path).unwrap();

    let (received, handler) = collector();
    replayer.subscribe(PORT, handler).unwrap();

    replayer.start();
    replay_to_end(&reactor, &replayer);

    let got = received.borrow();
    assert_eq!(got.len(), 50);
    for (i, (payload, _, _)) in got.iter().enumerate() {
        assert_eq!(payload, format!("payload {i}").as_bytes());
    }
    assert_eq!(replayer.stats().packets_delivered.get(), 50);
}

#[test]
fn rewind_replays_identical_sequence() {
    let packets: Vec<LegacyPacket> = (0..10u32)
        .map(|i| LegacyPacket::new(1, i, udp_frame(PORT, &i.to_be_bytes())))
        .collect();
    let capture = TempCapture::write(
        "rewind",
        &legacy_pcap(false, false, DLT_ETHERNET, &packets),
    );

    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
    replayer.open(&capture.path).unwrap();
    let (received, handler) = collector();
    replayer.subscribe(PORT, handler).unwrap();

    replayer.start();
    replay_to_end(&reactor, &replayer);
    let first_run: Vec<Vec<u8>> = received.borrow().iter().map(|d| d.0.clone()).collect();
    assert_eq!(first_run.len(), 10);

    received.borrow_mut().clear();
    replayer.rewind();
    assert!(!replayer.is_finished());
    replayer.start();
    replay_to_end(&reactor, &replayer);

    let second_run: Vec<Vec<u8>> = received.borrow().iter().map(|d| d.0.clone()).collect();
    assert_eq!(first_run, second_run);
}

#[test]
fn timed_replay_paces_by_capture_timestamps() {
    // Three packets at 0 ms, 20 ms, 50 ms file-relative.
    let packets = vec![
        LegacyPacket::new(100, 0, udp_frame(PORT, b"first")),
        LegacyPacket::new(100, 20_000, udp_frame(PORT, b"second")),
        LegacyPacket::new(100, 50_000, udp_frame(PORT, b"third")),
    ];
    let capture = TempCapture::write(
        "timed",
        &legacy_pcap(false, false, DLT_ETHERNET, &packets),
    );

    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, PcapConfig::default()).unwrap();
    replayer.open(&capture.path).unwrap();

    let arrivals: Rc<RefCell<Vec<Instant>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = arrivals.clone();
    replayer
        .subscribe(
            PORT,
            Box::new(move |_, _, _| sink.borrow_mut().push(Instant::now())),
        )
        .unwrap();

    replayer.start();
    let deadline = Instant::now() + Duration::from_secs(2);
    while arrivals.borrow().len() < 3 && Instant::now() < deadline {
        reactor.run_once(10).unwrap();
    }

    let times = arrivals.borrow();
    assert_eq!(times.len(), 3);
    let delta1 = times[1] - times[0];
    let delta2 = times[2] - times[1];
    assert!(
        delta1 >= Duration::from_millis(18) && delta1 <= Duration::from_millis(30),
        "delta1 = {delta1:?}"
    );
    assert!(
        delta2 >= Duration::from_millis(25) && delta2 <= Duration::from_millis(40),
        "delta2 = {delta2:?}"
    );
}

#[test]
fn timed_replay_honors_speed_multiplier() {
    // 100 ms of capture time replayed at 4x finishes in roughly 25 ms.
    let packets = vec![
        LegacyPacket::new(0, 0, udp_frame(PORT, b"a")),
        LegacyPacket::new(0, 100_000, udp_frame(PORT, b"b")),
    ];
    let capture = TempCapture::write(
        "speed",
        &legacy_pcap(false, false, DLT_ETHERNET, &packets),
    );

    let reactor = Reactor::new().unwrap();
    let config = PcapConfig {
        speed_multiplier: 4.0,
        ..PcapConfig::default()
    };
    let replayer = PcapReplayer::new(&reactor, config).unwrap();
    replayer.open(&capture.path).unwrap();

    let arrivals: Rc<RefCell<Vec<Instant>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = arrivals.clone();
    replayer
        .subscribe(
            PORT,
            Box::new(move |_, _, _| sink.borrow_mut().push(Instant::now())),
        )
        .unwrap();

    replayer.start();
    let deadline = Instant::now() + Duration::from_secs(2);
    while arrivals.borrow().len() < 2 && Instant::now() < deadline {
        reactor.run_once(10).unwrap();
    }

    let times = arrivals.borrow();
    assert_eq!(times.len(), 2);
    let delta = times[1] - times[0];
    assert!(
        delta >= Duration::from_millis(20) && delta <= Duration::from_millis(60),
        "delta = {delta:?}"
    );
}

#[test]
fn microsecond_dialect_scales_to_nanoseconds() {
    let packets = vec![LegacyPacket::new(7, 250, udp_frame(PORT, b"x"))];
    let capture = TempCapture::write(
        "micros",
        &legacy_pcap(false, false, DLT_ETHERNET, &packets),
    );

    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
    replayer.open(&capture.path).unwrap();
    let (received, handler) = collector();
    replayer.subscribe(PORT, handler).unwrap();
    replayer.start();
    replay_to_end(&reactor, &replayer);

    let got = received.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].2.sec, 7);
    assert_eq!(got[0].2.nsec, 250_000);
}

#[test]
fn nanosecond_dialect_passes_through() {
    let packets = vec![LegacyPacket::new(7, 250, udp_frame(PORT, b"x"))];
    let capture = TempCapture::write(
        "nanos",
        &legacy_pcap(true, false, DLT_ETHERNET, &packets),
    );

    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
    replayer.open(&capture.path).unwrap();
    let (received, handler) = collector();
    replayer.subscribe(PORT, handler).unwrap();
    replayer.start();
    replay_to_end(&reactor, &replayer);

    let got = received.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].2.sec, 7);
    assert_eq!(got[0].2.nsec, 250);
}

#[test]
fn byte_swapped_capture_decodes_identically() {
    let make_packets = || vec![LegacyPacket::new(11, 500, udp_frame(PORT, b"swap me"))];

    let mut results = Vec::new();
    for swapped in [false, true] {
        let capture = TempCapture::write(
            if swapped { "swapped" } else { "native" },
            &legacy_pcap(false, swapped, DLT_ETHERNET, &make_packets()),
        );

        let reactor = Reactor::new().unwrap();
        let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
        replayer.open(&capture.path).unwrap();
        let (received, handler) = collector();
        replayer.subscribe(PORT, handler).unwrap();
        replayer.start();
        replay_to_end(&reactor, &replayer);

        results.push(received.borrow().clone());
    }

    assert_eq!(results[0], results[1]);
    assert_eq!(results[0].len(), 1);
    assert_eq!(results[0][0].0, b"swap me");
}

#[test]
fn step_mode_delivers_one_packet_per_call() {
    let packets: Vec<LegacyPacket> = (0..3u32)
        .map(|i| LegacyPacket::new(1, i, udp_frame(PORT, &[i as u8])))
        .collect();
    let capture = TempCapture::write(
        "step",
        &legacy_pcap(false, false, DLT_ETHERNET, &packets),
    );

    let reactor = Reactor::new().unwrap();
    let config = PcapConfig {
        mode: ReplayMode::Step,
        ..PcapConfig::default()
    };
    let replayer = PcapReplayer::new(&reactor, config).unwrap();
    replayer.open(&capture.path).unwrap();
    let (received, handler) = collector();
    replayer.subscribe(PORT, handler).unwrap();

    // start() schedules nothing in STEP mode.
    replayer.start();
    reactor.run_once(0).unwrap();
    assert_eq!(received.borrow().len(), 0);

    for expected in 1..=3usize {
        assert!(replayer.step());
        assert_eq!(received.borrow().len(), expected);
    }
    assert!(!replayer.step());
    assert!(replayer.is_finished());
}

#[test]
fn cooked_capture_frames_decode() {
    let packets = vec![LegacyPacket::new(3, 0, sll_udp_frame(PORT, b"cooked"))];
    let capture = TempCapture::write(
        "sll",
        &legacy_pcap(false, false, DLT_LINUX_SLL, &packets),
    );

    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
    replayer.open(&capture.path).unwrap();
    let (received, handler) = collector();
    replayer.subscribe(PORT, handler).unwrap();
    replayer.start();
    replay_to_end(&reactor, &replayer);

    let got = received.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, b"cooked");
}

#[test]
fn capture_truncated_frames_are_dropped() {
    let mut truncated = LegacyPacket::new(1, 0, udp_frame(PORT, b"partial"));
    truncated.orig_len = Some(truncated.frame.len() as u32 + 100);
    let packets = vec![
        truncated,
        LegacyPacket::new(1, 1, udp_frame(PORT, b"complete")),
    ];
    let capture = TempCapture::write(
        "truncated",
        &legacy_pcap(false, false, DLT_ETHERNET, &packets),
    );

    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
    replayer.open(&capture.path).unwrap();
    let (received, handler) = collector();
    replayer.subscribe(PORT, handler).unwrap();
    replayer.start();
    replay_to_end(&reactor, &replayer);

    let got = received.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, b"complete");
    assert_eq!(replayer.stats().packets_dropped.get(), 1);
}

#[test]
fn unsubscribed_ports_are_ignored() {
    let packets = vec![
        LegacyPacket::new(1, 0, udp_frame(PORT, b"wanted")),
        LegacyPacket::new(1, 1, udp_frame(PORT + 1, b"unwanted")),
    ];
    let capture = TempCapture::write(
        "ports",
        &legacy_pcap(false, false, DLT_ETHERNET, &packets),
    );

    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
    replayer.open(&capture.path).unwrap();
    let (received, handler) = collector();
    replayer.subscribe(PORT, handler).unwrap();
    replayer.start();
    replay_to_end(&reactor, &replayer);

    let got = received.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, b"wanted");
}

#[test]
fn subscription_bookkeeping_errors() {
    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();

    let (_, handler) = collector();
    assert_eq!(replayer.subscribe(PORT, handler).unwrap(), PORT);

    let (_, handler) = collector();
    assert!(matches!(
        replayer.subscribe(PORT, handler),
        Err(Error::AddrInUse { port: PORT })
    ));

    replayer.unsubscribe(PORT).unwrap();
    assert!(matches!(replayer.unsubscribe(PORT), Err(Error::NotFound)));
}

#[test]
fn unknown_magic_is_a_format_error() {
    let capture = TempCapture::write("badmagic", &[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0]);
    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
    assert!(matches!(
        replayer.open(&capture.path),
        Err(Error::Format(_))
    ));
}

#[test]
fn pcapng_replay_delivers_with_default_resolution() {
    let packets = vec![
        NgPacket {
            interface_id: 0,
            ts_raw: 5 * 1_000_000 + 123, // microsecond ticks
            frame: udp_frame(PORT, b"ng one"),
        },
        NgPacket {
            interface_id: 0,
            ts_raw: 5 * 1_000_000 + 456,
            frame: udp_frame(PORT, b"ng two"),
        },
    ];
    let capture = TempCapture::write("ng", &pcapng(DLT_ETHERNET, None, &packets));

    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
    replayer.open(&capture.path).unwrap();
    let (received, handler) = collector();
    replayer.subscribe(PORT, handler).unwrap();
    replayer.start();
    replay_to_end(&reactor, &replayer);

    let got = received.borrow();
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].0, b"ng one");
    assert_eq!(got[0].2.sec, 5);
    assert_eq!(got[0].2.nsec, 123_000);
    assert_eq!(got[1].0, b"ng two");
}

#[test]
fn pcapng_tsresol_option_changes_resolution() {
    let packets = vec![NgPacket {
        interface_id: 0,
        ts_raw: 9 * 1_000_000_000 + 42, // nanosecond ticks
        frame: udp_frame(PORT, b"fine"),
    }];
    let capture = TempCapture::write("ngns", &pcapng(DLT_ETHERNET, Some(9), &packets));

    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
    replayer.open(&capture.path).unwrap();
    let (received, handler) = collector();
    replayer.subscribe(PORT, handler).unwrap();
    replayer.start();
    replay_to_end(&reactor, &replayer);

    let got = received.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].2.sec, 9);
    assert_eq!(got[0].2.nsec, 42);
}

#[test]
fn pcapng_forward_interface_reference_is_dropped() {
    let packets = vec![
        NgPacket {
            interface_id: 7, // never described
            ts_raw: 0,
            frame: udp_frame(PORT, b"orphan"),
        },
        NgPacket {
            interface_id: 0,
            ts_raw: 1,
            frame: udp_frame(PORT, b"valid"),
        },
    ];
    let capture = TempCapture::write("ngfwd", &pcapng(DLT_ETHERNET, None, &packets));

    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
    replayer.open(&capture.path).unwrap();
    let (received, handler) = collector();
    replayer.subscribe(PORT, handler).unwrap();
    replayer.start();
    replay_to_end(&reactor, &replayer);

    let got = received.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, b"valid");
}

#[test]
fn empty_capture_finishes_without_deliveries() {
    let capture = TempCapture::write(
        "empty",
        &legacy_pcap(false, false, DLT_ETHERNET, &[]),
    );

    let reactor = Reactor::new().unwrap();
    let replayer = PcapReplayer::new(&reactor, flood_config()).unwrap();
    replayer.open(&capture.path).unwrap();
    let (received, handler) = collector();
    replayer.subscribe(PORT, handler).unwrap();
    replayer.start();
    replay_to_end(&reactor, &replayer);

    assert!(received.borrow().is_empty());
}
