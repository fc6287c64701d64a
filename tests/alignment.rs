mod common;

use blkcore::helpers::IntAlignment;
use blkcore::memory::{self, DriverOp};
use blkcore::node::{NodePerm, NodeUser};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

static NODE_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

#[tokio::test]
async fn unaligned_write_reads_modifies_and_writes_boundary_units() {
    common::init_logging();
    let mut config = memory::Config::new(65536);
    config.request_alignment = 512;
    let node = common::open("rmw-scenario", config).await;
    let user = node
        .add_user(NodeUser::root("rmw-scenario-user").require(NodePerm::Write))
        .unwrap();

    assert_eq!(user.write(&[0xab; 4096], 513).await.unwrap(), 4096);
    assert_eq!(
        common::take_ops(&node),
        vec![
            DriverOp::Read {
                offset: 512,
                bytes: 512
            },
            DriverOp::Read {
                offset: 4608,
                bytes: 512
            },
            DriverOp::Write {
                offset: 512,
                bytes: 4608,
                fua: false
            },
        ]
    );

    let mut buf = vec![0u8; 4096];
    assert_eq!(user.read(&mut buf, 513).await.unwrap(), 4096);
    assert!(buf.iter().all(|b| *b == 0xab));

    // The bytes around the write were preserved
    let contents = common::contents(&node);
    assert_eq!(contents[512], 0);
    assert_eq!(contents[4609], 0);
}

#[tokio::test]
async fn write_inside_one_unit_reads_it_once() {
    let mut config = memory::Config::new(65536);
    config.request_alignment = 4096;
    let node = common::open("rmw-single-unit", config).await;
    let user = node
        .add_user(NodeUser::root("rmw-single-unit-user").require(NodePerm::Write))
        .unwrap();

    user.write(&[1; 100], 8200).await.unwrap();
    assert_eq!(
        common::take_ops(&node),
        vec![
            DriverOp::Read {
                offset: 8192,
                bytes: 4096
            },
            DriverOp::Write {
                offset: 8192,
                bytes: 4096,
                fua: false
            },
        ]
    );
}

#[tokio::test]
async fn transfers_are_split_at_max_transfer() {
    let mut config = memory::Config::new(65536);
    config.request_alignment = 512;
    config.max_transfer = 4096;
    let node = common::open("split-transfer", config).await;
    let user = node
        .add_user(NodeUser::root("split-transfer-user").require(NodePerm::Write))
        .unwrap();

    let data = pattern(10000);
    user.write(&data, 0).await.unwrap();
    assert_eq!(
        common::take_ops(&node),
        vec![
            DriverOp::Read {
                offset: 9728,
                bytes: 512
            },
            DriverOp::Write {
                offset: 0,
                bytes: 4096,
                fua: false
            },
            DriverOp::Write {
                offset: 4096,
                bytes: 4096,
                fua: false
            },
            DriverOp::Write {
                offset: 8192,
                bytes: 2048,
                fua: false
            },
        ]
    );

    let mut buf = vec![0u8; 10000];
    user.read(&mut buf, 0).await.unwrap();
    assert_eq!(buf, data);
    let reads = common::take_ops(&node)
        .into_iter()
        .filter(|op| matches!(op, DriverOp::Read { .. }))
        .count();
    assert_eq!(reads, 3);
}

#[tokio::test]
async fn fua_is_emulated_with_a_flush() {
    let node = common::open_memory("fua-emulated", 65536).await;
    let user = node
        .add_user(NodeUser::root("fua-emulated-user").require(NodePerm::Write))
        .unwrap();

    user.pwritev(0, (&[2u8; 512][..]).into(), blkcore::node::RequestFlag::Fua.into())
        .await
        .unwrap();
    assert_eq!(
        common::take_ops(&node),
        vec![
            DriverOp::Write {
                offset: 0,
                bytes: 512,
                fua: false
            },
            DriverOp::Flush,
        ]
    );
}

#[tokio::test]
async fn misaligned_buffers_are_bounced() {
    let mut config = memory::Config::new(65536);
    config.request_alignment = 512;
    config.min_mem_alignment = 4096;
    let node = common::open("bounce", config).await;
    let user = node
        .add_user(NodeUser::root("bounce-user").require(NodePerm::Write))
        .unwrap();

    let data = pattern(8192 + 1);
    // Start one byte into the vector so the buffer cannot be 4k-aligned
    user.write(&data[1..], 4096).await.unwrap();

    let mut buf = vec![0u8; 8192 + 1];
    user.read(&mut buf[1..], 4096).await.unwrap();
    assert_eq!(&buf[1..], &data[1..]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn alignment_bounds(offset in 0u64..(1 << 40), length in 0u64..(1 << 30), shift in 0u32..21) {
        let align = 1u64 << shift;
        prop_assert!(offset.align_down(align) <= offset);
        prop_assert!((offset + length).align_up(align).unwrap() >= offset + length);
        prop_assert!(offset.align_down(align).is_aligned(align));
    }

    #[test]
    fn padded_read_matches_direct_read(
        offset in 0u64..60000,
        length in 1u64..5000,
        shift in 0u32..13,
    ) {
        let size = 65536u64;
        let length = std::cmp::min(length, size - offset);
        let id = NODE_COUNTER.fetch_add(1, Ordering::SeqCst);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (read, expected) = rt.block_on(async {
            let mut config = memory::Config::new(size);
            config.request_alignment = 1 << shift;
            let node = common::open(&format!("padded-read-{}", id), config).await;
            let user = node
                .add_user(NodeUser::root("padded-read-user").require(NodePerm::Write))
                .unwrap();

            let data = pattern(size as usize);
            user.write(&data, 0).await.unwrap();

            let mut buf = vec![0u8; length as usize];
            user.read(&mut buf, offset).await.unwrap();
            node.close().await;

            (buf, data[offset as usize..(offset + length) as usize].to_vec())
        });
        prop_assert_eq!(read, expected);
    }
}
