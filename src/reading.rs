//! Value types carried across the read/write channels. These are opaque
//! payloads as far as the core is concerned: transformation, scaling, and
//! unit interpretation live in embedder-supplied callbacks (§1, out of
//! scope).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{device::DeviceId, runtime::Runtime, transaction::Transaction};

/// A single timestamped value produced by a device read.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub device_id: DeviceId,
    pub kind: String,
    pub unit: Option<String>,
    pub value: ReadingValue,
    /// RFC3339Nano timestamp at which the value was produced.
    pub timestamp: String,
    pub output: Option<OutputDescriptor>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ReadingValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    String(String),
}

/// Descriptor attached to a reading describing how it should be surfaced
/// (e.g. display name, scaling factor applied). Opaque to the core beyond
/// being threaded through to `GetOutputsForDevice`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutputDescriptor {
    pub name: String,
    pub kind: String,
}

/// One batch of readings produced by a single read, bulk-read, or listen
/// invocation for a device. By convention `readings` is non-empty; the state
/// manager overwrites the device's current readings atomically with the
/// whole batch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReadContext {
    pub device_id: DeviceId,
    pub readings: Vec<Reading>,
}

impl ReadContext {
    pub fn new(device_id: DeviceId, readings: Vec<Reading>) -> Self {
        Self { device_id, readings }
    }
}

/// Payload of a single write request, supplied by the RPC caller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WriteData {
    pub action: String,
    pub data: Vec<u8>,
    /// Caller-supplied transaction id. If set, it must be unique within the
    /// transactions cache or the write is rejected as a duplicate.
    pub transaction_id: Option<String>,
}

/// One queued write item: the transaction tracking it, the target device id,
/// and the payload to hand to the device's `Write` callback.
pub struct WriteContext<RT: Runtime> {
    pub transaction: Arc<Transaction<RT>>,
    pub device_id: DeviceId,
    pub data: WriteData,
}

impl<RT: Runtime> Clone for WriteContext<RT> {
    fn clone(&self) -> Self {
        Self {
            transaction: self.transaction.clone(),
            device_id: self.device_id.clone(),
            data: self.data.clone(),
        }
    }
}
