mod common;

use blkcore::memory::{self, DriverOp};
use blkcore::node::{
    self, BlockStatusFlag, DetectZeroes, DiscardMode, Node, NodeConfig, NodeConfigOrReference,
    NodePerm, NodeUser, RequestFlag, RequestFlags,
};
use blkcore::overlay;
use blkcore::ErrorKind;
use std::sync::Arc;

const CLUSTER: u64 = 4096;

fn reference(name: &str) -> NodeConfigOrReference {
    NodeConfigOrReference::Reference(name.to_string())
}

/// Overlay named `name` over a fresh `<name>-file`, optionally backed by `backing`
async fn open_overlay(name: &str, size: u64, backing: Option<&str>) -> Arc<Node> {
    common::open_memory(&format!("{}-file", name), size).await;
    let mut config = overlay::Config::new(reference(&format!("{}-file", name)));
    if let Some(backing) = backing {
        config = config.with_backing(reference(backing));
    }
    config.cluster_size = CLUSTER;
    config.size = Some(size);
    node::open(NodeConfig::new(name, config)).await.unwrap()
}

async fn write_at(node: &Arc<Node>, user_name: &str, fill: u8, offset: u64) {
    let user = node
        .add_user(NodeUser::root(user_name).require(NodePerm::Write))
        .unwrap();
    user.write(&[fill; CLUSTER as usize], offset).await.unwrap();
}

#[tokio::test]
async fn backing_can_be_changed() {
    common::init_logging();
    let base = common::open_memory("chg-base", 65536).await;
    write_at(&base, "chg-base-writer", 0x33, 0).await;

    let top = open_overlay("chg-top", 65536, None).await;
    let user = top.add_user(NodeUser::root("chg-top-user")).unwrap();
    let mut buf = vec![0xffu8; 512];
    user.read(&mut buf, 0).await.unwrap();
    assert!(buf.iter().all(|b| *b == 0));

    top.change_backing(Some(&base)).await.unwrap();
    assert_eq!(top.backing_node().unwrap().name(), "chg-base");
    user.read(&mut buf, 0).await.unwrap();
    assert!(buf.iter().all(|b| *b == 0x33));
    assert_eq!(base.parents().len(), 1);

    top.change_backing(None).await.unwrap();
    assert!(top.backing_node().is_none());
    user.read(&mut buf, 0).await.unwrap();
    assert!(buf.iter().all(|b| *b == 0));
    assert_eq!(top.quiesce_counter(), 0);
    assert_eq!(base.quiesce_counter(), 0);

    let err = base.change_backing(Some(&top)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn status_is_resolved_through_the_chain() {
    let base = common::open_memory("chain-base", 65536).await;
    let mid = open_overlay("chain-mid", 65536, Some("chain-base")).await;
    let top = open_overlay("chain-top", 65536, Some("chain-mid")).await;

    write_at(&base, "chain-base-writer", 1, 0).await;
    write_at(&mid, "chain-mid-writer", 2, CLUSTER).await;
    write_at(&top, "chain-top-writer", 3, 2 * CLUSTER).await;

    // Cluster 0 only exists in the base
    let report = top.block_status_above(None, 0, CLUSTER).await.unwrap();
    assert!(report.status.contains(BlockStatusFlag::Data));
    assert!(report.is_allocated());
    assert!(Arc::ptr_eq(report.file.as_ref().unwrap(), &base));
    assert_eq!(top.is_allocated(0, CLUSTER).await.unwrap(), (false, CLUSTER));
    assert!(!top.is_allocated_above(Some(&*base), false, 0, CLUSTER).await.unwrap().0);
    assert!(top.is_allocated_above(Some(&*base), true, 0, CLUSTER).await.unwrap().0);

    // Cluster 1 lives in the middle layer
    let (allocated, pnum) = top
        .is_allocated_above(Some(&*mid), true, CLUSTER, CLUSTER)
        .await
        .unwrap();
    assert!(allocated);
    assert_eq!(pnum, CLUSTER);
    let report = top.block_status_above(Some(&*mid), CLUSTER, CLUSTER).await.unwrap();
    assert!(!report.is_allocated());

    // Cluster 2 is the top's own
    let report = top.block_status_above(None, 2 * CLUSTER, CLUSTER).await.unwrap();
    assert!(report.status.contains(BlockStatusFlag::Data));
    assert!(report.status.contains(BlockStatusFlag::OffsetValid));
    assert_eq!(top.is_allocated(2 * CLUSTER, CLUSTER).await.unwrap(), (true, CLUSTER));

    let mut buf = vec![0u8; 3 * CLUSTER as usize];
    let user = top.add_user(NodeUser::root("chain-reader")).unwrap();
    user.read(&mut buf, 0).await.unwrap();
    for (i, fill) in [1u8, 2, 3].iter().enumerate() {
        let cluster = &buf[i * CLUSTER as usize..(i + 1) * CLUSTER as usize];
        assert!(cluster.iter().all(|b| b == fill), "cluster {}", i);
    }

    let report = top.block_status_above(None, 65536, 512).await.unwrap();
    assert_eq!(report.pnum, 0);
    assert!(report.status.contains(BlockStatusFlag::Eof));
}

#[tokio::test]
async fn dirty_bitmaps_record_writes() {
    let node = common::open_memory("dirty", 1 << 20).await;
    let bitmap = node.add_dirty_bitmap("backup", 4096).unwrap();
    assert_eq!(
        node.add_dirty_bitmap("backup", 4096).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );

    let user = node
        .add_user(NodeUser::root("dirty-user").require(NodePerm::Write))
        .unwrap();
    user.write(&[1u8; 100], 5000).await.unwrap();
    user.pwrite_zeroes(65536, 8192, RequestFlags::empty())
        .await
        .unwrap();

    {
        let bitmap = bitmap.lock().unwrap();
        assert!(!bitmap.is_set(0));
        assert!(bitmap.is_set(4096));
        assert!(!bitmap.is_set(8192));
        assert!(bitmap.any_set_in(65536, 8192));
        assert_eq!(bitmap.set_bytes(), 4096 + 8192);
    }

    assert!(Arc::ptr_eq(&node.get_dirty_bitmap("backup").unwrap(), &bitmap));
    node.remove_dirty_bitmap("backup").unwrap();
    assert_eq!(
        node.get_dirty_bitmap("backup").unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    user.write(&[1u8; 100], 0).await.unwrap();
    assert!(!bitmap.lock().unwrap().is_set(0));
}

#[tokio::test]
async fn permissions_are_enforced() {
    let node = common::open_memory("perm", 65536).await;

    let guard = node
        .add_user(NodeUser::root("perm-guard").block(NodePerm::Write))
        .unwrap();
    let err = node
        .add_user(NodeUser::root("perm-writer").require(NodePerm::Write))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
    assert!(node.get_perms().blocks(NodePerm::Write));
    drop(guard);
    assert!(!node.get_perms().blocks(NodePerm::Write));

    let reader = node.add_user(NodeUser::root("perm-reader")).unwrap();
    let err = reader.write(&[1u8; 512], 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);

    let writer = node
        .add_user(NodeUser::root("perm-writer").require(NodePerm::Write))
        .unwrap();
    writer.write(&[1u8; 512], 0).await.unwrap();
    let err = writer.write(&[1u8; 512], 65536 - 256).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);

    let resizer = node
        .add_user(NodeUser::root("perm-resizer").require(NodePerm::Write | NodePerm::Resize))
        .unwrap();
    resizer.write(&[1u8; 512], 65536 - 256).await.unwrap();
    assert_eq!(node.length(), 65536 + 256);
}

#[tokio::test]
async fn read_only_nodes_refuse_modification() {
    let mut opts = NodeConfig::new("ro", memory::Config::new(65536));
    opts.read_only = true;
    let node = node::open(opts).await.unwrap();

    let err = node
        .add_user(NodeUser::root("ro-writer").require(NodePerm::Write))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);

    let user = node.add_user(NodeUser::root("ro-reader")).unwrap();
    assert_eq!(
        user.write(&[1u8; 512], 0).await.unwrap_err().kind(),
        ErrorKind::Permission
    );
    assert_eq!(
        node.pdiscard(0, 512).await.unwrap_err().kind(),
        ErrorKind::Permission
    );
    let mut buf = [0u8; 512];
    user.read(&mut buf, 0).await.unwrap();
}

#[tokio::test]
async fn missing_medium_fails_requests() {
    let node = common::open_memory("medium", 65536).await;
    let user = node
        .add_user(NodeUser::root("medium-user").require(NodePerm::Write))
        .unwrap();
    let mut buf = [0u8; 512];

    node.with_driver(|d: &memory::Data| d.set_inserted(false))
        .unwrap();
    assert!(!node.is_inserted());
    assert_eq!(
        user.read(&mut buf, 0).await.unwrap_err().kind(),
        ErrorKind::NoMedium
    );
    assert_eq!(
        user.write(&buf, 0).await.unwrap_err().kind(),
        ErrorKind::NoMedium
    );
    node.with_driver(|d: &memory::Data| d.set_inserted(true))
        .unwrap();
    user.read(&mut buf, 0).await.unwrap();

    node.close().await;
    assert!(node::lookup("medium").is_err());
    assert_eq!(
        user.read(&mut buf, 0).await.unwrap_err().kind(),
        ErrorKind::NoMedium
    );
    assert_eq!(
        node.block_status(true, 0, 512).await.unwrap_err().kind(),
        ErrorKind::NoMedium
    );
}

#[tokio::test]
async fn discard_is_advisory() {
    // Ignored without `discard: unmap`
    let mut config = memory::Config::new(65536);
    config.discard = true;
    let ignoring = common::open("discard-ignore", config.clone()).await;
    ignoring.pdiscard(0, 4096).await.unwrap();
    assert!(common::take_ops(&ignoring).is_empty());

    // Skipped where the driver cannot discard
    let mut opts = NodeConfig::new("discard-unsupported", memory::Config::new(65536));
    opts.discard = DiscardMode::Unmap;
    let unsupported = node::open(opts).await.unwrap();
    unsupported.pdiscard(0, 4096).await.unwrap();
    assert!(common::take_ops(&unsupported).is_empty());

    let mut opts = NodeConfig::new("discard-unmap", config);
    opts.discard = DiscardMode::Unmap;
    let node = node::open(opts).await.unwrap();
    let user = node
        .add_user(NodeUser::root("discard-unmap-user").require(NodePerm::Write))
        .unwrap();
    user.write(&[7u8; 8192], 0).await.unwrap();
    common::take_ops(&node);

    node.pdiscard(0, 4096).await.unwrap();
    assert_eq!(
        common::take_ops(&node),
        vec![DriverOp::Discard {
            offset: 0,
            bytes: 4096
        }]
    );
    let contents = common::contents(&node);
    assert!(contents[..4096].iter().all(|b| *b == 0));
    assert!(contents[4096..8192].iter().all(|b| *b == 7));
}

#[tokio::test]
async fn zero_buffers_are_detected() {
    let mut config = memory::Config::new(65536);
    config.write_zeroes = true;
    config.discard = true;

    let mut opts = NodeConfig::new("detect-on", config.clone());
    opts.detect_zeroes = DetectZeroes::On;
    let on = node::open(opts).await.unwrap();
    let user = on
        .add_user(NodeUser::root("detect-on-user").require(NodePerm::Write))
        .unwrap();
    user.write(&[0u8; 4096], 0).await.unwrap();
    user.write(&[1u8; 4096], 4096).await.unwrap();
    assert_eq!(
        common::take_ops(&on),
        vec![
            DriverOp::WriteZeroes {
                offset: 0,
                bytes: 4096,
                unmap: false
            },
            DriverOp::Write {
                offset: 4096,
                bytes: 4096,
                fua: false
            },
        ]
    );

    let mut opts = NodeConfig::new("detect-unmap", config);
    opts.detect_zeroes = DetectZeroes::Unmap;
    opts.discard = DiscardMode::Unmap;
    let unmap = node::open(opts).await.unwrap();
    let user = unmap
        .add_user(NodeUser::root("detect-unmap-user").require(NodePerm::Write))
        .unwrap();
    user.write(&[0u8; 4096], 0).await.unwrap();
    assert_eq!(
        common::take_ops(&unmap),
        vec![DriverOp::WriteZeroes {
            offset: 0,
            bytes: 4096,
            unmap: true
        }]
    );

    // Without a native zero write, detected zeroes are written as data
    let mut opts = NodeConfig::new("detect-fallback", memory::Config::new(65536));
    opts.detect_zeroes = DetectZeroes::On;
    let fallback = node::open(opts).await.unwrap();
    let user = fallback
        .add_user(NodeUser::root("detect-fallback-user").require(NodePerm::Write))
        .unwrap();
    user.write(&[0u8; 4096], 0).await.unwrap();
    assert_eq!(
        common::take_ops(&fallback),
        vec![DriverOp::Write {
            offset: 0,
            bytes: 4096,
            fua: false
        }]
    );
    assert_eq!(fallback.write_generation(), 1);
}

#[tokio::test]
async fn zero_writes_can_forbid_fallback() {
    let node = common::open_memory("zero-nofallback", 65536).await;
    let user = node
        .add_user(NodeUser::root("zero-nofallback-user").require(NodePerm::Write))
        .unwrap();
    let err = user
        .pwrite_zeroes(0, 4096, RequestFlag::NoFallback.into())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
    assert!(common::take_ops(&node).is_empty());
}
