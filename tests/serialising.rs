mod common;

use blkcore::aio::AioContext;
use blkcore::coroutine;
use blkcore::memory;
use blkcore::node::sync::open_sync;
use blkcore::node::{NodeConfig, NodePerm, NodeUser, RequestFlag};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

static NODE_COUNTER: AtomicUsize = AtomicUsize::new(0);

const SIZE: u64 = 32768;

/// Whether `contents` is what some sequential order of `writes` (each filling its range with
/// `index + 1`) produces
fn is_linearizable(writes: &[(u64, u64)], contents: &[u8]) -> bool {
    let mut edges = BTreeSet::new();
    for (pos, value) in contents.iter().enumerate() {
        let pos = pos as u64;
        let covering: Vec<usize> = writes
            .iter()
            .enumerate()
            .filter(|(_, (offset, len))| *offset <= pos && pos < offset + len)
            .map(|(i, _)| i)
            .collect();

        if covering.is_empty() {
            if *value != 0 {
                return false;
            }
            continue;
        }

        let last = match (*value as usize).checked_sub(1) {
            Some(last) if covering.contains(&last) => last,
            _ => return false,
        };
        for earlier in covering.into_iter().filter(|w| *w != last) {
            edges.insert((earlier, last));
        }
    }

    // Topological sort of the "was overwritten by" relation
    let mut in_degree = vec![0usize; writes.len()];
    for (_, to) in &edges {
        in_degree[*to] += 1;
    }
    let mut ready: Vec<usize> = (0..writes.len()).filter(|w| in_degree[*w] == 0).collect();
    let mut ordered = 0;
    while let Some(w) = ready.pop() {
        ordered += 1;
        for (_, to) in edges.iter().filter(|(from, _)| *from == w) {
            in_degree[*to] -= 1;
            if in_degree[*to] == 0 {
                ready.push(*to);
            }
        }
    }
    ordered == writes.len()
}

#[test]
fn interleaved_content_is_not_linearizable() {
    // Write 1 won on the left, write 2 on the right of the shared range
    let writes = [(0, 8), (4, 8)];
    let mut contents = vec![1u8; 6];
    contents.extend_from_slice(&[2; 6]);
    contents[4] = 1;
    contents[5] = 2;
    assert!(!is_linearizable(&writes, &contents));

    let mut contents = vec![1u8; 4];
    contents.extend_from_slice(&[2; 8]);
    assert!(is_linearizable(&writes, &contents));
}

#[test]
fn joined_writes_of_one_caller_serialise() {
    common::init_logging();
    let ctx = AioContext::main().unwrap();
    let mut config = memory::Config::new(65536);
    config.request_alignment = 512;
    config.latency_us = 500;
    let node = open_sync(NodeConfig::new("joined-writes", config)).unwrap();
    let user = node
        .add_user(NodeUser::root("joined-writes-user").require(NodePerm::Write))
        .unwrap();

    // Both writes read-modify-write the same 512-byte unit from within one coroutine
    let (a, b) = coroutine::run(&ctx, async {
        futures::join!(user.write(&[0xaa; 100], 10), user.write(&[0xbb; 100], 300))
    });
    assert_eq!(a.unwrap(), 100);
    assert_eq!(b.unwrap(), 100);

    let contents = common::contents(&node);
    assert!(contents[..10].iter().all(|b| *b == 0));
    assert!(contents[10..110].iter().all(|b| *b == 0xaa));
    assert!(contents[110..300].iter().all(|b| *b == 0));
    assert!(contents[300..400].iter().all(|b| *b == 0xbb));
    assert!(contents[400..].iter().all(|b| *b == 0));
    assert_eq!(node.tracked_request_count(), 0);
    node.close_sync();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn concurrent_serialising_writes_linearize(
        writes in prop::collection::vec((0u64..16384, 1u64..8192), 2..8)
    ) {
        let id = NODE_COUNTER.fetch_add(1, Ordering::SeqCst);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let contents = rt.block_on(async {
            let mut config = memory::Config::new(SIZE);
            config.request_alignment = 512;
            // Split writes into several driver requests, each taking a while, so that
            // unserialised writes would interleave
            config.max_transfer = 4096;
            config.latency_us = 200;
            let node = common::open(&format!("linearize-{}", id), config).await;
            let queue = node
                .add_user(NodeUser::root("linearize-user").require(NodePerm::Write))
                .unwrap()
                .new_queue()
                .unwrap();

            let buffers: Vec<Vec<u8>> = writes
                .iter()
                .enumerate()
                .map(|(i, (_, len))| vec![(i + 1) as u8; *len as usize])
                .collect();
            let results = futures::future::join_all(writes.iter().zip(&buffers).map(
                |((offset, _), buf)| {
                    queue.pwritev(*offset, buf.as_slice().into(), RequestFlag::Serialising.into())
                },
            ))
            .await;
            for result in results {
                result.unwrap();
            }

            let contents = common::contents(&node);
            node.close().await;
            contents
        });

        prop_assert!(
            is_linearizable(&writes, &contents),
            "content is not the result of any sequential order of {:?}",
            writes
        );
    }
}
