//! End-to-end tests of the channel pool over loopback sockets

mod common;

use common::{any_port, closed_port, test_config, Harness, Seen, WAIT};
use sluice_core::{
    ChannelAlert, ChannelId, ChannelState, ConnectOptions, Error, PoolConfig, PoolEvent, PoolTotals,
    SendStatus, ServerId, StateReason,
};
use std::io::{Read, Write};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

/// Listen with an accept callback that reports (server, channel, peer)
fn listen(h: &Harness) -> (ServerId, SocketAddr, crossbeam_channel::Receiver<(ServerId, ChannelId, SocketAddr)>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let server = h
        .pool
        .listen_default(any_port(), move |_, server, channel, peer| {
            let _ = tx.send((server, channel, peer));
        })
        .unwrap();
    let addr = h.pool.server_address(server).unwrap();
    (server, addr, rx)
}

/// Connect the pool to a plain std listener and return both ends
fn channel_to_peer(h: &Harness) -> (ChannelId, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let channel = h.connect(&[listener.local_addr().unwrap()], ConnectOptions::default()).unwrap();
    let (peer, _) = listener.accept().unwrap();
    (channel, peer)
}

#[test]
fn test_listen_connect_send_roundtrip() {
    let h = Harness::new(test_config());
    let (server, addr, accepted) = listen(&h);

    let client = h.connect(&[addr], ConnectOptions::default()).unwrap();
    let (accepted_server, server_side, peer) = accepted.recv_timeout(WAIT).unwrap();

    assert_eq!(accepted_server, server);
    assert_ne!(client, server_side);
    assert_eq!(peer, h.pool.local_address(client).unwrap());
    assert_eq!(h.pool.peer_address(server_side).unwrap(), h.pool.local_address(client).unwrap());
    assert_eq!(h.pool.num_channels(), 2);

    assert_eq!(h.pool.send(client, b"hello".to_vec()).unwrap(), SendStatus::Queued);
    assert_eq!(h.read_exact(server_side, 5), b"hello");

    // And back the other way
    h.pool.send(server_side, &b"world"[..]).unwrap();
    assert_eq!(h.read_exact(client, 5), b"world");

    let stats = h.pool.channel_stats(client).unwrap();
    assert_eq!(stats.bytes_written, 5);
    assert_eq!(stats.bytes_read, 5);

    h.pool.close(client, true).unwrap();
    assert_eq!(h.wait_terminal(server_side), (ChannelState::Closed, StateReason::PeerClosed));

    h.pool.shutdown().unwrap();
}

#[test]
fn test_connected_states_reported() {
    let h = Harness::new(test_config());
    let (_, addr, accepted) = listen(&h);

    let client = h.connect(&[addr], ConnectOptions::default()).unwrap();
    let (_, server_side, _) = accepted.recv_timeout(WAIT).unwrap();

    let mut up = Vec::new();
    while up.len() < 2 {
        let seen = h.wait_for(|seen| match seen {
            Seen::State { channel, old: ChannelState::Connecting, new: ChannelState::Connected, reason } => {
                Some((*channel, *reason))
            }
            _ => None,
        });
        up.push(seen);
    }
    up.sort_by_key(|(channel, _)| *channel);
    let mut expected = vec![(client, StateReason::Established), (server_side, StateReason::Accepted)];
    expected.sort_by_key(|(channel, _)| *channel);
    assert_eq!(up, expected);

    h.pool.shutdown().unwrap();
}

#[test]
fn test_fifo_order_across_partial_writes() {
    let config = PoolConfig { write_high_water_mark: 64 << 20, ..test_config() };
    let h = Harness::new(config);
    let (channel, mut peer) = channel_to_peer(&h);

    const BUFFERS: u32 = 256;
    const WORDS: usize = 4096;

    let reader = thread::spawn(move || {
        let mut expected = 0u32;
        let mut word = [0u8; 4];
        while expected < BUFFERS * WORDS as u32 {
            peer.read_exact(&mut word).unwrap();
            assert_eq!(u32::from_le_bytes(word), expected);
            expected += 1;
        }
    });

    // 256 buffers of 16 KiB, far more than the socket buffers hold at once
    let mut next = 0u32;
    for _ in 0..BUFFERS {
        let mut buf = Vec::with_capacity(WORDS * 4);
        for _ in 0..WORDS {
            buf.extend_from_slice(&next.to_le_bytes());
            next += 1;
        }
        assert_ne!(h.pool.send(channel, buf).unwrap(), SendStatus::Rejected);
    }

    reader.join().unwrap();
    assert_eq!(h.pool.channel_stats(channel).unwrap().bytes_written, (BUFFERS as u64) * WORDS as u64 * 4);
    h.pool.shutdown().unwrap();
}

#[test]
fn test_backpressure_single_low_water_alert() {
    let config = PoolConfig { write_high_water_mark: 256 << 20, ..test_config() };
    let h = Harness::new(config);
    let (channel, mut peer) = channel_to_peer(&h);

    // The peer is not reading yet; this is more than the socket buffers hold
    const PAYLOAD: usize = 64 << 20;
    assert_eq!(h.pool.send(channel, vec![7u8; PAYLOAD]).unwrap(), SendStatus::Queued);

    h.pool.set_write_watermarks(channel, 16 << 10, 64 << 10).unwrap();
    assert_eq!(h.pool.send(channel, b"late".to_vec()).unwrap(), SendStatus::Rejected);
    assert_eq!(h.pool.send(channel, b"later".to_vec()).unwrap(), SendStatus::Rejected);

    let reader = thread::spawn(move || {
        let mut buf = vec![0u8; 256 << 10];
        let mut total = 0;
        while total < PAYLOAD {
            total += peer.read(&mut buf).unwrap();
        }
        peer
    });

    let mut high = 0;
    h.wait_for(|seen| match seen {
        Seen::Alert { channel: c, alert: ChannelAlert::HighWater } if *c == channel => {
            high += 1;
            None
        }
        Seen::Alert { channel: c, alert: ChannelAlert::LowWater } if *c == channel => Some(()),
        _ => None,
    });
    let _peer = reader.join().unwrap();

    let late = h.drain_for(Duration::from_millis(300));
    let count = |alert: ChannelAlert| {
        late.iter().filter(|s| matches!(s, Seen::Alert { alert: a, .. } if *a == alert)).count()
    };
    assert_eq!(high + count(ChannelAlert::HighWater), 1, "one high-water alert per arming");
    assert_eq!(count(ChannelAlert::LowWater), 0, "one low-water alert per arming");

    // Below the mark again: sends are accepted
    assert_eq!(h.pool.send(channel, b"more".to_vec()).unwrap(), SendStatus::Queued);
    assert!(h.pool.channel_stats(channel).unwrap().max_queued_bytes > 64 << 10);

    h.pool.shutdown().unwrap();
}

#[test]
fn test_send_rejected_between_marks_until_low_water() {
    let config = PoolConfig { write_high_water_mark: 256 << 20, ..test_config() };
    let h = Harness::new(config);
    let (channel, mut peer) = channel_to_peer(&h);

    const PAYLOAD: usize = 64 << 20;
    assert_eq!(h.pool.send(channel, vec![1u8; PAYLOAD]).unwrap(), SendStatus::Queued);
    h.pool.set_write_watermarks(channel, 16 << 10, 64 << 10).unwrap();
    assert_eq!(h.pool.send(channel, b"over".to_vec()).unwrap(), SendStatus::Rejected);

    // Raise the high mark above the queue: it now sits between the two marks
    h.pool.set_write_watermarks(channel, 16 << 10, 256 << 20).unwrap();
    let queued = h.pool.channel_stats(channel).unwrap().queued_bytes;
    assert!(queued > 16 << 10 && queued <= 256 << 20, "queued {queued}");
    for _ in 0..3 {
        assert_eq!(h.pool.send(channel, b"between".to_vec()).unwrap(), SendStatus::Rejected);
    }

    let reader = thread::spawn(move || {
        let mut buf = vec![0u8; 256 << 10];
        let mut total = 0;
        while total < PAYLOAD {
            total += peer.read(&mut buf).unwrap();
        }
        peer
    });
    h.wait_for(|seen| match seen {
        Seen::Alert { channel: c, alert: ChannelAlert::LowWater } if *c == channel => Some(()),
        _ => None,
    });
    let _peer = reader.join().unwrap();

    assert_eq!(h.pool.send(channel, b"after".to_vec()).unwrap(), SendStatus::Queued);
    h.pool.shutdown().unwrap();
}

#[test]
fn test_unbounded_connect_durations() {
    let h = Harness::new(test_config());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();

    // An effectively infinite timeout still connects
    let options = ConnectOptions::new(Duration::MAX, 1, Duration::from_millis(10));
    let channel = h.connect(&[listener.local_addr().unwrap()], options).unwrap();
    assert_eq!(h.pool.pending_connects(), 0);
    h.pool.send(channel, b"up".to_vec()).unwrap();

    // An effectively infinite retry wait parks the request until shutdown
    let (tx, parked) = crossbeam_channel::bounded(1);
    let options = ConnectOptions::new(Duration::from_secs(1), 2, Duration::MAX);
    h.pool
        .connect(&[closed_port()], options, move |_, _, result| {
            let _ = tx.send(result);
        })
        .unwrap();
    h.wait_for(|seen| match seen {
        Seen::Pool(PoolEvent::ConnectAttemptFailed { attempt: 1, .. }) => Some(()),
        _ => None,
    });
    assert_eq!(h.pool.pending_connects(), 1);

    // The connector is still alive and serving other requests
    let second = h.connect(&[listener.local_addr().unwrap()], ConnectOptions::default()).unwrap();
    assert_ne!(second, channel);

    h.pool.shutdown().unwrap();
    assert!(matches!(parked.recv_timeout(WAIT).unwrap(), Err(Error::Shutdown)));
}

#[test]
fn test_retry_terminates_after_max_attempts() {
    let h = Harness::new(test_config());
    let target = closed_port();
    let options = ConnectOptions::new(Duration::from_secs(1), 3, Duration::from_millis(20));

    let (tx, rx) = crossbeam_channel::bounded(1);
    let request = h
        .pool
        .connect(&[target], options, move |_, request, result| {
            let _ = tx.send((request, result));
        })
        .unwrap();

    let (reported, result) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(reported, request);
    match result {
        Err(Error::ConnectFailure { attempts, last_error }) => {
            assert_eq!(attempts, 3);
            assert!(last_error.is_some());
        }
        other => panic!("expected ConnectFailure, got {other:?}"),
    }

    let attempts: Vec<_> = h
        .drain_for(Duration::from_millis(200))
        .into_iter()
        .filter_map(|seen| match seen {
            Seen::Pool(PoolEvent::ConnectAttemptFailed { request_id, address, attempt, .. }) => {
                assert_eq!(request_id, request);
                assert_eq!(address, target);
                Some(attempt)
            }
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(h.pool.pending_connects(), 0);
    assert_eq!(h.pool.num_channels(), 0);

    h.pool.shutdown().unwrap();
}

#[test]
fn test_failover_to_next_address() {
    let h = Harness::new(test_config());
    let dead = closed_port();
    let live = TcpListener::bind("127.0.0.1:0").unwrap();

    let options = ConnectOptions::new(Duration::from_secs(1), 1, Duration::from_millis(20));
    let channel = h.connect(&[dead, live.local_addr().unwrap()], options).unwrap();
    assert_eq!(h.pool.peer_address(channel).unwrap(), live.local_addr().unwrap());

    let failed = h.wait_for(|seen| match seen {
        Seen::Pool(PoolEvent::ConnectAttemptFailed { address, attempt, .. }) => Some((*address, *attempt)),
        _ => None,
    });
    assert_eq!(failed, (dead, 1));

    h.pool.shutdown().unwrap();
}

#[test]
fn test_concurrent_shutdown_is_idempotent() {
    let h = Harness::new(test_config());
    let (_, addr, accepted) = listen(&h);
    let client = h.connect(&[addr], ConnectOptions::default()).unwrap();
    let (_, server_side, _) = accepted.recv_timeout(WAIT).unwrap();

    // A request parked in its retry wait gets cancelled
    let (tx, pending) = crossbeam_channel::bounded(1);
    let options = ConnectOptions::new(Duration::from_secs(1), 2, Duration::from_secs(30));
    h.pool
        .connect(&[closed_port()], options, move |_, _, result| {
            let _ = tx.send(result);
        })
        .unwrap();

    let barrier = Arc::new(Barrier::new(8));
    let callers: Vec<_> = (0..8)
        .map(|_| {
            let pool = h.pool.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                pool.shutdown()
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap().unwrap();
    }

    assert!(h.pool.is_shut_down());
    assert!(matches!(pending.recv_timeout(WAIT).unwrap(), Err(Error::Shutdown)));
    assert!(matches!(
        h.pool.connect(&[addr], ConnectOptions::default(), |_, _, _| {}),
        Err(Error::Shutdown)
    ));
    assert!(matches!(h.pool.send(client, b"late".to_vec()), Err(Error::ChannelNotFound(_))));

    // Both ends got exactly one final transition, and it was Closed
    let mut terminal: HashMap<ChannelId, Vec<ChannelState>> = HashMap::new();
    for seen in h.drain_for(Duration::from_millis(500)) {
        if let Seen::State { channel, new, .. } = seen {
            if new.is_terminal() {
                terminal.entry(channel).or_default().push(new);
            }
        }
    }
    assert_eq!(terminal.len(), 2, "{terminal:?}");
    assert_eq!(terminal[&client], vec![ChannelState::Closed]);
    assert_eq!(terminal[&server_side], vec![ChannelState::Closed]);
    assert_eq!(h.pool.num_channels(), 0);
    h.pool.shutdown().unwrap();
}

#[test]
fn test_sequential_channels_stay_balanced() {
    let config = PoolConfig { thread_count: 4, ..test_config() };
    let h = Harness::new(config);
    let (_, addr, accepted) = listen(&h);

    let mut clients = Vec::new();
    for n in 1..=21 {
        clients.push(TcpStream::connect(addr).unwrap());
        accepted.recv_timeout(WAIT).unwrap();

        let loads = h.pool.manager_loads();
        let max = loads.iter().max().unwrap();
        let min = loads.iter().min().unwrap();
        assert!(max - min <= 1, "unbalanced loads {loads:?}");
        assert_eq!(loads.iter().sum::<usize>(), n);
    }

    h.pool.shutdown().unwrap();
}

#[test]
fn test_callbacks_stay_on_owner_thread() {
    let h = Harness::new(PoolConfig { thread_count: 3, ..test_config() });
    let (_, addr, accepted) = listen(&h);

    let mut peers = Vec::new();
    let mut owners = Vec::new();
    for _ in 0..6 {
        peers.push(TcpStream::connect(addr).unwrap());
        let (_, channel, _) = accepted.recv_timeout(WAIT).unwrap();
        owners.push((channel, h.pool.channel_owner(channel).unwrap()));
    }

    for round in 0..5u8 {
        for peer in &mut peers {
            peer.write_all(&[round]).unwrap();
        }
        let mut waiting: HashMap<ChannelId, usize> = owners.iter().copied().collect();
        while !waiting.is_empty() {
            let (channel, thread) = h.wait_for(|seen| match seen {
                Seen::Data { channel, thread, .. } => Some((*channel, thread.clone())),
                _ => None,
            });
            let owner = owners.iter().find(|(c, _)| *c == channel).map(|(_, o)| *o).unwrap();
            assert_eq!(thread, format!("sluice-mgr-{owner}"));
            assert_eq!(h.pool.channel_owner(channel).unwrap(), owner);
            waiting.remove(&channel);
        }
    }

    h.pool.shutdown().unwrap();
}

#[test]
fn test_graceful_close_drains_queue() {
    let h = Harness::new(test_config());
    let (channel, mut peer) = channel_to_peer(&h);

    let payload = vec![42u8; 1 << 20];
    h.pool.send(channel, payload.clone()).unwrap();
    h.pool.close(channel, true).unwrap();

    // Closing twice is harmless; the channel is no longer usable
    assert!(matches!(h.pool.close(channel, true), Ok(()) | Err(Error::ChannelNotFound(_))));
    assert!(matches!(h.pool.send(channel, b"x".to_vec()), Err(Error::ChannelNotFound(_))));

    let mut received = Vec::new();
    peer.read_to_end(&mut received).unwrap();
    assert_eq!(received.len(), payload.len());

    // Besides coming up, the only callback is the final transition
    let after_close: Vec<_> = h
        .drain_for(Duration::from_millis(300))
        .into_iter()
        .filter(|seen| match seen {
            Seen::State { old: ChannelState::Connecting, .. } => false,
            Seen::State { channel: c, .. } | Seen::Alert { channel: c, .. } | Seen::Data { channel: c, .. } => {
                *c == channel
            }
            Seen::Pool(_) => false,
        })
        .collect();
    assert_eq!(after_close.len(), 1, "{after_close:?}");
    assert!(matches!(
        after_close[0],
        Seen::State {
            old: ChannelState::Connected | ChannelState::Closing,
            new: ChannelState::Closed,
            reason: StateReason::LocalClose,
            ..
        }
    ));
    assert!(matches!(h.pool.channel_stats(channel), Err(Error::ChannelNotFound(_))));
    h.pool.shutdown().unwrap();
}

#[test]
fn test_forced_close_reports_only_final_transition() {
    let h = Harness::new(test_config());
    let (channel, _peer) = channel_to_peer(&h);
    h.wait_for(|seen| match seen {
        Seen::State { channel: c, new: ChannelState::Connected, .. } if *c == channel => Some(()),
        _ => None,
    });

    h.pool.close(channel, false).unwrap();
    let transitions: Vec<_> = h
        .drain_for(Duration::from_millis(300))
        .into_iter()
        .filter_map(|seen| match seen {
            Seen::State { channel: c, old, new, reason } if c == channel => Some((old, new, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(transitions, vec![(ChannelState::Connected, ChannelState::Closed, StateReason::LocalClose)]);
    h.pool.shutdown().unwrap();
}

#[test]
fn test_peer_close_reports_closing_then_closed() {
    let h = Harness::new(test_config());
    let (channel, peer) = channel_to_peer(&h);
    drop(peer);

    let transitions: Vec<_> = (0..2)
        .map(|_| {
            h.wait_for(|seen| match seen {
                Seen::State { channel: c, old, new, reason } if *c == channel && *new != ChannelState::Connected => {
                    Some((*old, *new, *reason))
                }
                _ => None,
            })
        })
        .collect();

    assert_eq!(
        transitions,
        vec![
            (ChannelState::Connected, ChannelState::Closing, StateReason::PeerClosed),
            (ChannelState::Closing, ChannelState::Closed, StateReason::PeerClosed),
        ]
    );
    h.pool.shutdown().unwrap();
}

#[test]
fn test_read_suspends_at_high_water_and_resumes() {
    let config = PoolConfig { read_high_water_mark: 16 << 10, read_chunk_size: 4 << 10, ..test_config() };
    let h = Harness::new(config);
    h.consume.store(false, std::sync::atomic::Ordering::SeqCst);
    let (channel, mut peer) = channel_to_peer(&h);

    peer.write_all(&vec![1u8; 64 << 10]).unwrap();
    h.wait_for(|seen| match seen {
        Seen::Alert { channel: c, alert: ChannelAlert::ReadSuspended } if *c == channel => Some(()),
        _ => None,
    });

    h.consume.store(true, std::sync::atomic::Ordering::SeqCst);
    h.pool.enable_read(channel).unwrap();
    h.wait_for(|seen| match seen {
        Seen::Alert { channel: c, alert: ChannelAlert::ReadEnabled } if *c == channel => Some(()),
        _ => None,
    });

    // Everything arrives once reading resumed
    let deadline = std::time::Instant::now() + WAIT;
    while h.pool.channel_stats(channel).unwrap().bytes_read < 64 << 10 {
        assert!(std::time::Instant::now() < deadline, "reading did not resume");
        thread::sleep(Duration::from_millis(10));
    }

    h.pool.disable_read(channel).unwrap();
    h.wait_for(|seen| match seen {
        Seen::Alert { channel: c, alert: ChannelAlert::ReadDisabled } if *c == channel => Some(()),
        _ => None,
    });
    h.pool.shutdown().unwrap();
}

#[test]
fn test_import_existing_socket() {
    let h = Harness::new(test_config());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    let channel = h.pool.import(stream).unwrap();
    h.wait_for(|seen| match seen {
        Seen::State { channel: c, new: ChannelState::Connected, reason: StateReason::Imported, .. } if *c == channel => {
            Some(())
        }
        _ => None,
    });

    h.pool.send(channel, b"imported".to_vec()).unwrap();
    let mut buf = [0u8; 8];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"imported");

    h.pool.close(channel, false).unwrap();
    assert_eq!(h.wait_terminal(channel), (ChannelState::Closed, StateReason::LocalClose));
    h.pool.shutdown().unwrap();
}

#[test]
fn test_channel_limit() {
    let config = PoolConfig { max_channels: Some(1), ..test_config() };
    let h = Harness::new(config);
    let (server, addr, _accepted) = listen(&h);

    let (_first, _peer) = channel_to_peer(&h);

    let refused = h.connect(&[addr], ConnectOptions::default());
    assert!(matches!(refused, Err(Error::ChannelLimit)));

    let _client = TcpStream::connect(addr).unwrap();
    let event = h.wait_for(|seen| match seen {
        Seen::Pool(event @ PoolEvent::ChannelLimit { .. }) => Some(event.clone()),
        _ => None,
    });
    assert!(matches!(event, PoolEvent::ChannelLimit { server_id, .. } if server_id == server));
    assert_eq!(h.pool.num_channels(), 1);
    h.pool.shutdown().unwrap();
}

#[test]
fn test_stop_listen() {
    let h = Harness::new(test_config());
    let (server, addr, _) = listen(&h);

    h.pool.stop_listen(server).unwrap();
    assert!(matches!(h.pool.server_address(server), Err(Error::ServerNotFound(_))));
    assert!(matches!(h.pool.stop_listen(server), Err(Error::ServerNotFound(_))));

    // The manager closes the socket asynchronously
    let deadline = std::time::Instant::now() + WAIT;
    while TcpStream::connect(addr).is_ok() {
        assert!(std::time::Instant::now() < deadline, "listener still accepting");
        thread::sleep(Duration::from_millis(10));
    }
    h.pool.shutdown().unwrap();
}

#[test]
fn test_watermark_update() {
    let h = Harness::new(test_config());
    let (channel, _peer) = channel_to_peer(&h);

    assert!(matches!(h.pool.set_write_watermarks(channel, 10, 1), Err(Error::Config(_))));
    h.pool.set_write_watermarks(channel, 0, 4).unwrap();
    assert_eq!(h.pool.send(channel, b"12345".to_vec()).unwrap(), SendStatus::HighWater);

    h.pool.reset_max_queued(channel).unwrap();
    h.pool.shutdown().unwrap();
}

#[test]
fn test_connect_by_host_name() {
    let h = Harness::new(test_config());
    let (_, addr, accepted) = listen(&h);

    let (tx, rx) = crossbeam_channel::bounded(1);
    h.pool
        .connect_host("127.0.0.1", addr.port(), ConnectOptions::default(), move |_, _, result| {
            let _ = tx.send(result);
        })
        .unwrap();
    let channel = rx.recv_timeout(WAIT).unwrap().unwrap();
    accepted.recv_timeout(WAIT).unwrap();
    assert_eq!(h.pool.peer_address(channel).unwrap(), addr);

    let result = h.pool.connect_host("nowhere.invalid", 80, ConnectOptions::default(), |_, _, _| {});
    match result {
        Err(Error::Resolve { host, .. }) => assert_eq!(host, "nowhere.invalid"),
        other => panic!("expected resolve error, got {other:?}"),
    }
    assert_eq!(h.pool.pending_connects(), 0);
    h.pool.shutdown().unwrap();
}

#[test]
fn test_pool_totals_and_reset() {
    let h = Harness::new(test_config());
    let (channel, mut peer) = channel_to_peer(&h);

    assert_eq!(h.pool.send(channel, vec![7u8; 1000]).unwrap(), SendStatus::Queued);
    let mut echoed = [0u8; 1000];
    peer.read_exact(&mut echoed).unwrap();
    peer.write_all(&[1u8; 300]).unwrap();
    h.read_exact(channel, 300);

    let totals = h.pool.totals();
    assert_eq!(totals, PoolTotals { bytes_read: 300, bytes_written: 1000, bytes_requested: 1000 });
    assert_eq!(h.pool.reset_totals(), totals);
    assert_eq!(h.pool.totals(), PoolTotals::default());

    // The channel is the only socket its manager watches
    let owner = h.pool.channel_owner(channel).unwrap();
    let deadline = Instant::now() + WAIT;
    while h.pool.num_events(owner) != Some(1) {
        assert!(Instant::now() < deadline, "registrations: {:?}", h.pool.num_events(owner));
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(h.pool.num_events(h.pool.num_threads()), None);
    h.pool.shutdown().unwrap();
}
