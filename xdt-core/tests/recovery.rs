//! Recovery scenarios under simulated loss: Go-Back-N after a dropped DT,
//! failed connect, and abort after persistent loss.

use std::time::Duration;

use rstest::rstest;

use xdt_core::fault::ErrorCase;
use xdt_core::sdu::Sdu;

mod common;
use common::{assert_silent, await_sdu, create_services, data_request, opening_request};

#[rstest]
#[timeout(Duration::from_secs(15))]
// Test goal:
//  - recover from the loss of one DT
// Configuration:
//  - drop the first DT with sequence 4 on the sending side
//  - the retransmission timeout replays the window; the consumer sees every
//    chunk exactly once, in order
fn a_lost_dt_is_recovered_by_go_back_n() {
    let net = create_services(52011, 52012, ErrorCase::Dat4Once, ErrorCase::None);
    let consumer = net.consumer();
    let producer = net.producer();

    producer
        .send(&opening_request(net.endpoints(), false, &[1]))
        .unwrap();
    let Sdu::DataConfirm { conn, .. } = await_sdu(&producer, "the opening confirmation", |s| {
        matches!(s, Sdu::DataConfirm { .. })
    }) else {
        unreachable!()
    };

    for sequ in 2..=5u32 {
        producer
            .send(&data_request(conn, sequ, false, &[sequ as u8]))
            .unwrap();
    }

    // DT 4 vanished once; 5 arrived out of order and was dropped silently,
    // then the Go-Back-N round replayed the window
    for sequ in 1..=5u32 {
        let Sdu::DataIndication(ind) = await_sdu(&consumer, "in-order delivery", |s| {
            matches!(s, Sdu::DataIndication(_))
        }) else {
            unreachable!()
        };
        assert_eq!(ind.sequ, sequ, "deliveries must stay in sequence order");
        assert_eq!(ind.data, vec![sequ as u8]);
    }

    // the replayed duplicates must not surface as further deliveries
    assert_silent(&consumer, Duration::from_millis(500));
}

#[rstest]
#[timeout(Duration::from_secs(15))]
// Test goal:
//  - failing connect
// Configuration:
//  - drop every DT with sequence 1 on the sending side; the initial-ACK
//    timer aborts, the consumer never hears anything
fn a_lost_opening_dt_aborts_the_connect() {
    let net = create_services(52021, 52022, ErrorCase::Dat1, ErrorCase::None);
    let consumer = net.consumer();
    let producer = net.producer();

    producer
        .send(&opening_request(net.endpoints(), true, b"hi"))
        .unwrap();

    let abort = await_sdu(&producer, "the abort indication", |s| {
        matches!(s, Sdu::AbortIndication { .. })
    });
    assert!(matches!(abort, Sdu::AbortIndication { .. }));
    assert_silent(&consumer, Duration::from_millis(500));
}

#[rstest]
#[timeout(Duration::from_secs(15))]
// Test goal:
//  - persistent loss aborts the connection on both sides
// Configuration:
//  - drop every DT with sequence > 2 on the sending side: the sender's
//    overall timer and the receiver's idle timer both expire
fn persistent_loss_aborts_both_sides() {
    let net = create_services(52031, 52032, ErrorCase::Dat3Up, ErrorCase::None);
    let consumer = net.consumer();
    let producer = net.producer();

    producer
        .send(&opening_request(net.endpoints(), false, &[1]))
        .unwrap();
    let Sdu::DataConfirm { conn, .. } = await_sdu(&producer, "the opening confirmation", |s| {
        matches!(s, Sdu::DataConfirm { .. })
    }) else {
        unreachable!()
    };

    for sequ in 2..=4u32 {
        producer
            .send(&data_request(conn, sequ, false, &[sequ as u8]))
            .unwrap();
    }

    // chunks 1 and 2 still made it through
    for sequ in 1..=2u32 {
        let Sdu::DataIndication(ind) = await_sdu(&consumer, "the delivered prefix", |s| {
            matches!(s, Sdu::DataIndication(_))
        }) else {
            unreachable!()
        };
        assert_eq!(ind.sequ, sequ);
    }

    // then both ends give up
    await_sdu(&consumer, "the consumer abort", |s| {
        matches!(s, Sdu::AbortIndication { .. })
    });
    await_sdu(&producer, "the producer abort", |s| {
        matches!(s, Sdu::AbortIndication { .. })
    });
}
