#![allow(dead_code)]

use blkcore::memory;
use blkcore::node::{self, Node, NodeConfig, NodeDriverConfig};
use std::sync::Arc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub async fn open(name: &str, driver: impl Into<NodeDriverConfig>) -> Arc<Node> {
    node::open(NodeConfig::new(name, driver)).await.unwrap()
}

pub async fn open_memory(name: &str, size: u64) -> Arc<Node> {
    open(name, memory::Config::new(size)).await
}

/// Driver operations the memory node received since the last call
pub fn take_ops(node: &Node) -> Vec<memory::DriverOp> {
    node.with_driver(|d: &memory::Data| d.take_ops()).unwrap()
}

pub fn contents(node: &Node) -> Vec<u8> {
    node.with_driver(|d: &memory::Data| d.contents()).unwrap()
}
