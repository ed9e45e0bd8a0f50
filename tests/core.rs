//! Cross-module scenarios on the sim transport.
//!
//! Every test touches the process-wide state, so they serialize on a lock
//! and leave the reference count at zero.

use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;

use rportals::transport::sim::SimNet;
use rportals::transport::PeerAddr;
use rportals::*;

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn serialize() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// A sim net with one interface, ready for `init_with`.
fn loopback_net() -> Arc<SimNet> {
    let net = SimNet::new();
    net.add_iface("sim0");
    net
}

#[test]
fn not_initialized_before_init() {
    let _guard = serialize();
    assert!(!is_initialized());
    assert_eq!(Ni::alloc(NiConfig::physical()).unwrap_err(), Error::NotInitialized);
}

#[test]
fn concurrent_init_fini_constructs_once() -> Result<()> {
    let _guard = serialize();

    let threads: Vec<_> = (0..8)
        .map(|_| {
            std::thread::spawn(|| {
                init().unwrap();
                std::thread::sleep(Duration::from_millis(5));
                assert!(is_initialized());
                fini();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert!(!is_initialized());

    // The state is reconstructible after full teardown.
    init()?;
    let ni = Ni::alloc(NiConfig::physical())?;
    drop(ni);
    fini();
    assert!(!is_initialized());
    Ok(())
}

#[test]
fn sub_object_keeps_ni_alive() -> Result<()> {
    let _guard = serialize();
    init()?;

    let ni = Ni::alloc(NiConfig::physical())?;
    let handle = ni.handle();
    let mr = alloc_mr(&ni, 0x1000, 4096)?;
    drop(ni);

    // The region holds the NI checked out.
    let ni = Ni::lookup(handle)?;
    drop(ni);
    drop(mr);
    assert_eq!(Ni::lookup(handle).unwrap_err(), Error::InvalidHandle);

    fini();
    Ok(())
}

#[test]
fn partial_post_recovery() -> Result<()> {
    let _guard = serialize();
    let net = loopback_net();
    init_with(net.clone())?;

    let mut config = NiConfig::physical();
    config.prepost_recv = 0;
    // Cap the pool at exactly one batch so free-list accounting is exact.
    config.limits.max_bufs = 10;
    let ni = Ni::alloc(config)?;
    let body = ni.body()?;

    net.iface("sim0").unwrap().reject_posts_from(5);
    assert_eq!(post_recv(&ni, 10)?, 5);

    assert_eq!(body.posted_recv(), 5);
    assert_eq!(body.recv_queued(), 5);
    assert_eq!(body.bufs_live(), 5);
    // The rejected five went back to the free list.
    assert_eq!(body.bufs_available(), 5);

    drop(body);
    drop(ni);
    fini();
    Ok(())
}

#[test]
fn post_fails_only_when_pool_is_empty() -> Result<()> {
    let _guard = serialize();
    init_with(loopback_net())?;

    let mut config = NiConfig::physical();
    config.prepost_recv = 0;
    config.limits.max_bufs = 4;
    let ni = Ni::alloc(config)?;

    // A short pool posts what it can.
    assert_eq!(post_recv(&ni, 10)?, 4);
    // Nothing left to allocate.
    assert_eq!(post_recv(&ni, 1).unwrap_err(), Error::PostFailed);

    drop(ni);
    fini();
    Ok(())
}

#[test]
fn physical_peer_connects_and_releases_ops() -> Result<()> {
    let _guard = serialize();
    let net = loopback_net();
    init_with(net.clone())?;

    let ni = Ni::alloc(NiConfig::physical())?;
    let body = ni.body()?;
    let addr = PeerAddr::new(Ipv4Addr::new(10, 77, 0, 1), 7710);
    let conn = body.conn_for_peer(addr)?;

    let (tx, rx) = mpsc::channel();
    for i in 0..3 {
        let tx = tx.clone();
        conn.submit(Box::new(move |r| {
            tx.send((i, r)).unwrap();
        }));
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        let (i, r) = rx.recv_timeout(Duration::from_secs(5))?;
        assert!(r.is_ok());
        order.push(i);
    }
    assert_eq!(order, vec![0, 1, 2]);
    assert_eq!(conn.state(), ConnState::Connected);

    drop(body);
    drop(ni);
    fini();
    Ok(())
}

#[test]
fn retry_exhaustion_fails_queued_ops() -> Result<()> {
    let _guard = serialize();
    let net = loopback_net();
    init_with(net.clone())?;

    let mut config = NiConfig::physical();
    config.retry_limit = 1;
    let ni = Ni::alloc(config)?;
    let body = ni.body()?;

    // Initial attempt plus one retry both fail.
    net.iface("sim0").unwrap().fail_next_addr_resolves(2);

    let addr = PeerAddr::new(Ipv4Addr::new(10, 77, 0, 1), 7710);
    let conn = body.conn_for_peer(addr)?;
    let (tx, rx) = mpsc::channel();
    for _ in 0..2 {
        let tx = tx.clone();
        conn.submit(Box::new(move |r| {
            tx.send(r).unwrap();
        }));
    }

    for _ in 0..2 {
        let r = rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(r, Err(Error::ConnectionFailed));
    }
    assert_eq!(conn.state(), ConnState::Disconnected);
    assert_eq!(conn.queued(), 0);

    drop(body);
    drop(ni);
    fini();
    Ok(())
}

#[test]
fn logical_rank_rides_node_main_connection() -> Result<()> {
    let _guard = serialize();
    let net = loopback_net();
    init_with(net)?;

    // One node, two ranks; we are the main rank 0. Rank 1 has no transport
    // connection of its own and rides the node's main link.
    let addr = PeerAddr::new(Ipv4Addr::new(10, 77, 0, 1), 7710);
    let map = RankMap::new(vec![
        RankEntry {
            rank: 0,
            main_rank: 0,
            nid: 0,
            pid: 100,
            addr,
        },
        RankEntry {
            rank: 1,
            main_rank: 0,
            nid: 0,
            pid: 101,
            addr,
        },
    ])?;
    let ni = Ni::alloc(NiConfig::logical(map, 0))?;
    let body = ni.body()?;
    assert!(body.is_main());

    let conn = body.conn_for_rank(1)?;
    let (tx, rx) = mpsc::channel();
    conn.submit(Box::new(move |r| {
        tx.send(r).unwrap();
    }));

    assert!(rx.recv_timeout(Duration::from_secs(5))?.is_ok());
    assert_eq!(conn.state(), ConnState::Connected);
    assert_eq!(
        body.conn_for_rank(0).unwrap_err(),
        Error::InvalidArgument("rank is the local process")
    );

    drop(body);
    drop(ni);
    fini();
    Ok(())
}

#[test]
fn recv_completion_updates_accounting() -> Result<()> {
    let _guard = serialize();
    let net = loopback_net();
    init_with(net.clone())?;

    let mut config = NiConfig::physical();
    config.prepost_recv = 8;
    let ni = Ni::alloc(config)?;
    let body = ni.body()?;
    assert_eq!(body.posted_recv(), 8);
    assert_eq!(body.bufs_live(), 8);

    // Complete two receives from the transport side; the event thread
    // drains the completion queue and reclaims the buffers.
    let srq = net.srq(body.local_info().srq_num).unwrap();
    assert_eq!(srq.depth(), 8);
    assert_eq!(srq.complete_recvs(2, 64), 2);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while body.posted_recv() != 6 {
        assert!(std::time::Instant::now() < deadline, "completions not drained");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(body.recv_queued(), 6);
    assert_eq!(body.bufs_live(), 6);

    drop(body);
    drop(ni);
    fini();
    Ok(())
}
