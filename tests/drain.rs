mod common;

use blkcore::memory;
use blkcore::node::{self, NodeConfig, NodeConfigOrReference, NodePerm, NodeUser};
use blkcore::raw;
use std::time::Duration;

#[tokio::test]
async fn drained_section_waits_for_and_holds_back_requests() {
    common::init_logging();
    let mut config = memory::Config::new(65536);
    config.latency_us = 2000;
    let node = common::open("drain-isolation", config).await;
    let queue = node
        .add_user(NodeUser::root("drain-isolation-user").require(NodePerm::Write))
        .unwrap()
        .new_queue()
        .unwrap();

    let first = queue.write(&[1u8; 512], 0);
    tokio::pin!(first);
    assert!(futures::poll!(&mut first).is_pending());
    assert_eq!(node.in_flight(), 1);

    // Beginning the section completes only after the request in flight did
    let (result, ()) = futures::join!(&mut first, node.drained_begin());
    assert_eq!(result.unwrap(), 512);
    assert_eq!(node.in_flight(), 0);
    assert_eq!(node.write_generation(), 1);

    let second = queue.write(&[2u8; 512], 512);
    tokio::pin!(second);
    assert!(futures::poll!(&mut second).is_pending());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(futures::poll!(&mut second).is_pending());
    assert_eq!(node.write_generation(), 1);
    assert!(common::contents(&node)[512..1024].iter().all(|b| *b == 0));

    node.drained_end().await;
    assert_eq!(second.await.unwrap(), 512);
    assert_eq!(node.write_generation(), 2);
    assert!(common::contents(&node)[512..1024].iter().all(|b| *b == 2));
}

#[tokio::test]
async fn subtree_drain_reaches_children() {
    let file = common::open_memory("subtree-file", 65536).await;
    let top = node::open(NodeConfig::new(
        "subtree-top",
        raw::Config::new(NodeConfigOrReference::Reference("subtree-file".into())),
    ))
    .await
    .unwrap();

    top.subtree_drained_begin().await;
    assert!(top.is_quiesced());
    assert!(file.is_quiesced());
    top.subtree_drained_end().await;
    assert!(!top.is_quiesced());
    assert!(!file.is_quiesced());
    assert_eq!(top.quiesce_counter(), 0);
    assert_eq!(file.quiesce_counter(), 0);
}

#[tokio::test]
async fn draining_the_file_quiesces_the_format_node() {
    let file = common::open_memory("drain-up-file", 65536).await;
    let top = node::open(NodeConfig::new(
        "drain-up-top",
        raw::Config::new(NodeConfigOrReference::Reference("drain-up-file".into())),
    ))
    .await
    .unwrap();
    let queue = top
        .add_user(NodeUser::root("drain-up-user").require(NodePerm::Write))
        .unwrap()
        .new_queue()
        .unwrap();

    file.drained_begin().await;
    assert!(top.is_quiesced());

    let write = queue.write(&[3u8; 512], 0);
    tokio::pin!(write);
    assert!(futures::poll!(&mut write).is_pending());

    file.drained_end().await;
    assert_eq!(write.await.unwrap(), 512);
    assert!(common::contents(&file)[..512].iter().all(|b| *b == 3));
}

#[tokio::test]
async fn drain_waits_for_requests_issued_through_children() {
    let mut config = memory::Config::new(65536);
    config.latency_us = 2000;
    let _file = common::open("drain-child-io-file", config).await;
    let top = node::open(NodeConfig::new(
        "drain-child-io-top",
        raw::Config::new(NodeConfigOrReference::Reference("drain-child-io-file".into())),
    ))
    .await
    .unwrap();
    let user = top
        .add_user(NodeUser::root("drain-child-io-user").require(NodePerm::Write))
        .unwrap();

    let write = user.write(&[4u8; 4096], 0);
    tokio::pin!(write);
    assert!(futures::poll!(&mut write).is_pending());

    let (result, ()) = futures::join!(&mut write, top.subtree_drained_begin());
    result.unwrap();
    assert_eq!(top.in_flight(), 0);
    top.subtree_drained_end().await;
}

#[tokio::test]
async fn dropped_requests_leave_nothing_in_flight() {
    let mut config = memory::Config::new(65536);
    config.request_alignment = 512;
    config.latency_us = 5000;
    let node = common::open("drain-dropped", config).await;
    let user = node
        .add_user(NodeUser::root("drain-dropped-user").require(NodePerm::Write))
        .unwrap();
    let queue = user.new_queue().unwrap();

    let mut write = Box::pin(user.write(&[1u8; 100], 10));
    assert!(futures::poll!(&mut write).is_pending());
    let mut flush = Box::pin(queue.flush());
    let _ = futures::poll!(&mut flush);
    assert!(node.in_flight() > 0);

    drop(write);
    drop(flush);
    assert_eq!(node.in_flight(), 0);
    assert_eq!(user.in_flight(), 0);
    assert_eq!(node.tracked_request_count(), 0);

    tokio::time::timeout(Duration::from_secs(2), node.drained_begin())
        .await
        .unwrap();
    node.drained_end().await;
}
