//! Data service over the simulated medium
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

mod sim;
use sim::*;

use lpwan_rfmac::mac_802154::{
    Config, DataConfirm, DeviceRole, FrameKind, MacState, RxDropReason, Status, TxOptions,
    filter::Rule,
};

#[test]
fn acked_unicast() {
    let mut sim = Sim::new();
    let a = sim.add(0x0001, DeviceRole::Sensor);
    let b = sim.add(0x0002, DeviceRole::Sensor);

    sim.nodes[a].submit(&request(1, addr(0x0002), TxOptions::ACK.bits()), b"hello");
    sim.run(20);

    assert_eq!(sim.listener(a).confirms, &[DataConfirm{ handle: 1, status: Status::Success }]);

    let (ind, payload) = &sim.listener(b).received[0];
    assert_eq!(ind.src, addr(0x0001));
    assert_eq!(ind.dst, addr(0x0002));
    assert_eq!(payload, b"hello");

    assert_eq!(sim.kinds(), &[FrameKind::Data, FrameKind::Ack]);
    assert!(sim.history()[1].packet().is_ack_for(ind.seq));

    assert_eq!(sim.nodes[a].state(), MacState::Idle);
    assert_eq!(sim.nodes[b].state(), MacState::Idle);
}

#[test]
fn queued_frames_sent_in_order() {
    let mut sim = Sim::new();
    let a = sim.add(0x0001, DeviceRole::Sensor);
    let b = sim.add(0x0002, DeviceRole::Sensor);

    for handle in 0..3 {
        sim.nodes[a].submit(&request(handle, addr(0x0002), TxOptions::ACK.bits()), &[handle]);
    }
    assert_eq!(sim.nodes[a].queue_len(), 3);

    sim.run(60);

    let handles: Vec<_> = sim.listener(a).confirms.iter().map(|c| (c.handle, c.status)).collect();
    assert_eq!(handles, &[(0, Status::Success), (1, Status::Success), (2, Status::Success)]);

    let payloads: Vec<_> = sim.listener(b).received.iter().map(|(_, p)| p[0]).collect();
    assert_eq!(payloads, &[0, 1, 2]);

    // Sequence numbers increase per frame
    let seqs: Vec<_> = sim.listener(b).received.iter().map(|(i, _)| i.seq).collect();
    assert_eq!(seqs, &[1, 2, 3]);
}

#[test]
fn broadcast_reaches_all_without_ack() {
    let mut sim = Sim::new();
    let a = sim.add(0x0001, DeviceRole::Sensor);
    let b = sim.add(0x0002, DeviceRole::Sensor);
    let c = sim.add(0x0003, DeviceRole::EnergyDonor);

    sim.nodes[a].submit(&request(4, broadcast(), TxOptions::ACK.bits()), &[0x55]);
    sim.run(20);

    assert_eq!(sim.kinds(), &[FrameKind::Data]);
    assert!(!sim.history()[0].packet().header.ack_request);

    assert_eq!(sim.listener(a).confirms, &[DataConfirm{ handle: 4, status: Status::Success }]);
    assert_eq!(sim.listener(b).received.len(), 1);
    assert_eq!(sim.listener(c).received.len(), 1);
}

#[test]
fn foreign_frames_filtered() {
    let mut sim = Sim::new();
    let a = sim.add(0x0001, DeviceRole::Sensor);
    let b = sim.add(0x0002, DeviceRole::Sensor);
    let c = sim.add(0x0003, DeviceRole::Sensor);

    sim.nodes[a].submit(&request(1, addr(0x0003), TxOptions::ACK.bits()), &[1]);
    sim.run(20);

    assert!(sim.listener(b).received.is_empty());
    // The data frame is filtered, the destination-less ACK is not
    assert_eq!(sim.listener(b).drops, &[RxDropReason::Filtered(Rule::DstShort)]);

    assert_eq!(sim.listener(c).received.len(), 1);
    assert_eq!(sim.listener(a).confirms[0].status, Status::Success);
}

#[test]
fn lossy_link_exhausts_retries() {
    let mut sim = Sim::new();
    let a = sim.add(0x0001, DeviceRole::Sensor);
    let _b = sim.add_with(0x0002, DeviceRole::Sensor, Config::default(), 1.0);

    sim.nodes[a].submit(&request(8, addr(0x0002), TxOptions::ACK.bits()), &[1, 2]);
    sim.run(100);

    assert_eq!(sim.listener(a).confirms, &[DataConfirm{ handle: 8, status: Status::NoAck }]);

    // Original transmission plus the configured retries, never acknowledged
    assert_eq!(sim.kinds(), vec![FrameKind::Data; 4]);
    assert!(sim.history().iter().all(|t| t.packet().header.seq == 1));

    assert_eq!(sim.nodes[a].state(), MacState::Idle);
    assert_eq!(sim.nodes[a].queue_len(), 0);
}

#[test]
fn busy_channel_fails_access() {
    let mut sim = Sim::new();
    let a = sim.add(0x0001, DeviceRole::Sensor);
    let _b = sim.add(0x0002, DeviceRole::Sensor);

    sim.jam(true);
    sim.nodes[a].submit(&request(2, addr(0x0002), 0), &[1]);
    sim.run(100);

    assert!(sim.kinds().is_empty());
    assert_eq!(sim.listener(a).confirms, &[DataConfirm{ handle: 2, status: Status::ChannelAccessFailure }]);

    // Next frame gets through once the channel clears
    sim.jam(false);
    sim.nodes[a].submit(&request(3, addr(0x0002), 0), &[2]);
    sim.run(20);

    assert_eq!(sim.listener(a).confirms[1], DataConfirm{ handle: 3, status: Status::Success });
}

#[test]
fn ack_takes_priority_over_pending_wait() {
    let mut sim = Sim::new();
    let a = sim.add(0x0001, DeviceRole::Sensor);
    let b = sim.add(0x0002, DeviceRole::Sensor);

    // Nobody answers 0x0009
    sim.nodes[a].submit(&request(1, addr(0x0009), TxOptions::ACK.bits()), &[1]);
    sim.run_until(a, MacState::AckPending, 20);

    sim.nodes[b].submit(&request(2, addr(0x0001), TxOptions::ACK.bits()), &[2]);
    sim.run(8);

    assert_eq!(sim.listener(b).confirms, &[DataConfirm{ handle: 2, status: Status::Success }]);
    assert_eq!(sim.listener(a).received.len(), 1);

    let acks: Vec<_> = sim.history().into_iter().filter(|t| t.kind == FrameKind::Ack).collect();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].from, a);

    // The interrupted wait counts as a retry
    assert_eq!(sim.nodes[a].counters().retries, 1);
}

#[test]
fn ack_reply_preempts_channel_access() {
    let mut sim = Sim::new();
    let b = sim.add(0x0002, DeviceRole::Sensor);
    let a = sim.add(0x0001, DeviceRole::Sensor);

    sim.nodes[b].submit(&request(1, addr(0x0001), TxOptions::ACK.bits()), &[0x11]);
    sim.step();

    // b's frame lands while a is still backing off
    sim.nodes[a].submit(&request(2, addr(0x0002), TxOptions::ACK.bits()), &[0x22]);
    sim.step();
    sim.step();

    assert_eq!(&sim.listener(a).states[..3], &[MacState::ChannelAccess, MacState::Idle, MacState::Sending]);

    sim.run(40);

    assert_eq!(sim.kinds(), &[FrameKind::Data, FrameKind::Ack, FrameKind::Data, FrameKind::Ack]);
    assert_eq!(sim.history()[1].from, a);
    assert_eq!(sim.history()[2].from, a);

    // The preempted head resumed once the ACK was out
    assert_eq!(sim.listener(a).confirms, &[DataConfirm{ handle: 2, status: Status::Success }]);
    assert_eq!(sim.listener(b).confirms, &[DataConfirm{ handle: 1, status: Status::Success }]);
    assert_eq!(sim.listener(b).received[0].1, &[0x22]);
}
