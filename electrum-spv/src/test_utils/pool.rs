use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::network::{NetworkBucket, PoolHandle, ServerAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolCall {
    CheckBucket(ServerAddr, Option<NetworkBucket>),
    FeeEstimates(ServerAddr, BTreeMap<u32, u64>),
    TipProcessed(ServerAddr, bool),
    ConnectionDown(ServerAddr),
}

/// A [`PoolHandle`] that records callbacks and answers bucket checks with a fixed verdict.
pub struct RecordingPool {
    allow_bucket: bool,
    calls: Mutex<Vec<PoolCall>>,
}

impl RecordingPool {
    pub fn new() -> Self {
        Self {
            allow_bucket: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting_buckets() -> Self {
        Self {
            allow_bucket: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<PoolCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: PoolCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Default for RecordingPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PoolHandle for RecordingPool {
    async fn check_bucket(&self, server: &ServerAddr, bucket: Option<NetworkBucket>) -> bool {
        self.record(PoolCall::CheckBucket(server.clone(), bucket));
        self.allow_bucket
    }

    async fn fee_estimates_updated(&self, server: &ServerAddr, estimates: BTreeMap<u32, u64>) {
        self.record(PoolCall::FeeEstimates(server.clone(), estimates));
    }

    async fn tip_processed(&self, server: &ServerAddr, updated: bool) {
        self.record(PoolCall::TipProcessed(server.clone(), updated));
    }

    async fn connection_down(&self, server: &ServerAddr) {
        self.record(PoolCall::ConnectionDown(server.clone()));
    }
}
