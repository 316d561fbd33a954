//! Collaborator interfaces supplied by the host daemon
//!
//! The core never talks to the audio pipeline, the wire protocol or the
//! message bus directly; the host hands it these seams at load time.

use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Ownership lookups against the host's stream registries.
pub trait ObjectRegistry: Send + Sync {
    /// Client owning the given sink-input, if any.
    fn sink_input_owner(&self, index: u32) -> Option<u32>;

    /// Client owning the given source-output, if any.
    fn source_output_owner(&self, index: u32) -> Option<u32>;
}

/// A single bus value as used by the portal contract.
#[derive(Debug, Clone, PartialEq)]
pub enum BusValue {
    U32(u32),
    String(String),
    ObjectPath(String),
    StringArray(Vec<String>),
    /// `DICT<STRING,VARIANT>`; variant values carried as JSON.
    Dict(HashMap<String, serde_json::Value>),
}

/// An outgoing method call.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<BusValue>,
}

/// Reply to a method call.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodReply {
    pub args: Vec<BusValue>,
}

impl MethodReply {
    /// Single object-path reply, as returned by `AccessDevice`.
    pub fn object_path(&self) -> Option<&str> {
        match self.args.first() {
            Some(BusValue::ObjectPath(path)) => Some(path),
            _ => None,
        }
    }
}

/// An incoming signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub interface: String,
    pub member: String,
    /// Object path the signal was emitted on.
    pub path: String,
    pub args: Vec<BusValue>,
}

impl SignalMessage {
    /// Fetch a `UINT32` argument by position.
    pub fn u32_arg(&self, index: usize) -> Option<u32> {
        match self.args.get(index) {
            Some(BusValue::U32(value)) => Some(*value),
            _ => None,
        }
    }
}

/// Handle for an installed signal filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterHandle(pub u64);

/// Callback invoked for every incoming signal; returns `true` once handled.
pub type SignalFilter = Box<dyn Fn(&SignalMessage) -> bool + Send + Sync>;

/// Bus transport errors
#[derive(Debug)]
pub enum BusError {
    /// No connection to the bus
    Disconnected,

    /// The method call could not be sent
    SendFailed(String),

    /// The reply did not carry the expected arguments
    MalformedReply(String),

    /// The match rule was rejected
    MatchFailed(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "bus disconnected"),
            Self::SendFailed(msg) => write!(f, "failed to send message: {}", msg),
            Self::MalformedReply(msg) => write!(f, "malformed reply: {}", msg),
            Self::MatchFailed(msg) => write!(f, "failed to install match: {}", msg),
        }
    }
}

impl Error for BusError {}

/// Message transport to the desktop portal, borrowed from the host.
#[async_trait]
pub trait PortalBus: Send + Sync {
    /// Send a method call and await its reply. No timeout is applied; the
    /// portal is a local service and answers promptly or not at all.
    async fn call(&self, msg: MethodCall) -> Result<MethodReply, BusError>;

    /// Install a match rule for incoming signals.
    fn add_match(&self, expression: &str) -> Result<(), BusError>;

    /// Install a signal filter.
    fn add_filter(&self, filter: SignalFilter) -> FilterHandle;

    /// Remove a previously installed filter.
    fn remove_filter(&self, handle: FilterHandle);
}
