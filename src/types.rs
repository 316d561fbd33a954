//! Core types for the access-control subsystem

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of operation categories the host asks the core to
/// authorize before acting on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessHook {
    GetSinkInfo,
    GetSourceInfo,
    GetSinkInputInfo,
    GetSourceOutputInfo,
    GetClientInfo,
    GetModuleInfo,
    GetCardInfo,
    GetSampleInfo,
    GetServerInfo,
    Stat,
    PlaySample,
    ConnectPlayback,
    ConnectRecord,
    MoveSinkInput,
    SetSinkInputVolume,
    SetSinkInputMute,
    KillSinkInput,
    MoveSourceOutput,
    SetSourceOutputVolume,
    SetSourceOutputMute,
    KillSourceOutput,
    KillClient,
    FilterSubscribeEvent,
}

impl AccessHook {
    /// Number of hook kinds; sizes rule tables and decision caches.
    pub const COUNT: usize = 23;

    /// All hook kinds in declaration order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::GetSinkInfo,
        Self::GetSourceInfo,
        Self::GetSinkInputInfo,
        Self::GetSourceOutputInfo,
        Self::GetClientInfo,
        Self::GetModuleInfo,
        Self::GetCardInfo,
        Self::GetSampleInfo,
        Self::GetServerInfo,
        Self::Stat,
        Self::PlaySample,
        Self::ConnectPlayback,
        Self::ConnectRecord,
        Self::MoveSinkInput,
        Self::SetSinkInputVolume,
        Self::SetSinkInputMute,
        Self::KillSinkInput,
        Self::MoveSourceOutput,
        Self::SetSourceOutputVolume,
        Self::SetSourceOutputMute,
        Self::KillSourceOutput,
        Self::KillClient,
        Self::FilterSubscribeEvent,
    ];

    /// Stable index into rule tables and decision caches.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Get a human-readable description of the hook kind
    pub fn description(&self) -> &'static str {
        match self {
            Self::GetSinkInfo => "Inspect a sink",
            Self::GetSourceInfo => "Inspect a source",
            Self::GetSinkInputInfo => "Inspect a playback stream",
            Self::GetSourceOutputInfo => "Inspect a record stream",
            Self::GetClientInfo => "Inspect another client",
            Self::GetModuleInfo => "Inspect a loaded module",
            Self::GetCardInfo => "Inspect a card",
            Self::GetSampleInfo => "Inspect a cached sample",
            Self::GetServerInfo => "Inspect the server",
            Self::Stat => "Query memory statistics",
            Self::PlaySample => "Play a cached sample",
            Self::ConnectPlayback => "Open a playback stream",
            Self::ConnectRecord => "Open a record stream",
            Self::MoveSinkInput => "Move a playback stream",
            Self::SetSinkInputVolume => "Change playback stream volume",
            Self::SetSinkInputMute => "Mute a playback stream",
            Self::KillSinkInput => "Kill a playback stream",
            Self::MoveSourceOutput => "Move a record stream",
            Self::SetSourceOutputVolume => "Change record stream volume",
            Self::SetSourceOutputMute => "Mute a record stream",
            Self::KillSourceOutput => "Kill a record stream",
            Self::KillClient => "Kill another client",
            Self::FilterSubscribeEvent => "Deliver a subscription event",
        }
    }
}

impl fmt::Display for AccessHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Low bits of a subscription event mask: the object category.
pub const FACILITY_MASK: u32 = 0x000F;

/// Higher bits of a subscription event mask: the event type.
pub const EVENT_TYPE_MASK: u32 = 0x0030;

/// Coarse object category carried in the low bits of a subscription event.
///
/// Discriminants match the wire encoding of the subscription mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum Facility {
    Sink = 0x0000,
    Source = 0x0001,
    SinkInput = 0x0002,
    SourceOutput = 0x0003,
    Module = 0x0004,
    Client = 0x0005,
    SampleCache = 0x0006,
    Server = 0x0007,
    Card = 0x0009,
}

impl Facility {
    /// Decode the facility bits of an event mask.
    pub fn from_event(event: u32) -> Option<Self> {
        match event & FACILITY_MASK {
            0x0000 => Some(Self::Sink),
            0x0001 => Some(Self::Source),
            0x0002 => Some(Self::SinkInput),
            0x0003 => Some(Self::SourceOutput),
            0x0004 => Some(Self::Module),
            0x0005 => Some(Self::Client),
            0x0006 => Some(Self::SampleCache),
            0x0007 => Some(Self::Server),
            0x0009 => Some(Self::Card),
            _ => None,
        }
    }

    /// The info query a client would use to learn about this kind of object.
    pub fn info_hook(self) -> AccessHook {
        match self {
            Self::Sink => AccessHook::GetSinkInfo,
            Self::Source => AccessHook::GetSourceInfo,
            Self::SinkInput => AccessHook::GetSinkInputInfo,
            Self::SourceOutput => AccessHook::GetSourceOutputInfo,
            Self::Module => AccessHook::GetModuleInfo,
            Self::Client => AccessHook::GetClientInfo,
            Self::SampleCache => AccessHook::GetSampleInfo,
            Self::Server => AccessHook::GetServerInfo,
            Self::Card => AccessHook::GetCardInfo,
        }
    }
}

/// Event type carried in the higher bits of a subscription event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum EventType {
    New = 0x0000,
    Change = 0x0010,
    Remove = 0x0020,
}

impl EventType {
    /// Decode the type bits of an event mask.
    pub fn from_event(event: u32) -> Option<Self> {
        match event & EVENT_TYPE_MASK {
            0x0000 => Some(Self::New),
            0x0010 => Some(Self::Change),
            0x0020 => Some(Self::Remove),
            _ => None,
        }
    }

    /// Compose an event mask from this type and a facility.
    pub fn with_facility(self, facility: Facility) -> u32 {
        self as u32 | facility as u32
    }
}

/// Outcome of evaluating an access hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Permit the operation.
    Grant,
    /// Deny the operation.
    Deny,
    /// Decision pending; the verdict arrives through the request's completer.
    Pending,
}

impl Verdict {
    /// Whether the operation may proceed now.
    pub fn is_grant(self) -> bool {
        matches!(self, Self::Grant)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grant => write!(f, "grant"),
            Self::Deny => write!(f, "deny"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

/// One pending operation submitted to the core for a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRequest {
    /// Operation category being authorized.
    pub hook: AccessHook,
    /// Index of the requesting client (destination client for events).
    pub client_index: u32,
    /// Index of the object the operation targets.
    pub object_index: u32,
    /// Subscription mask; meaningful only for `FilterSubscribeEvent`.
    pub event: u32,
}

impl AccessRequest {
    /// Request for a plain operation hook.
    pub fn new(hook: AccessHook, client_index: u32, object_index: u32) -> Self {
        Self {
            hook,
            client_index,
            object_index,
            event: 0,
        }
    }

    /// Request describing a subscription event bound for `client_index`.
    pub fn subscribe_event(client_index: u32, event: u32, object_index: u32) -> Self {
        Self {
            hook: AccessHook::FilterSubscribeEvent,
            client_index,
            object_index,
            event,
        }
    }
}

type CompleteFn = Box<dyn FnOnce(&AccessRequest, bool) + Send + Sync>;

/// Capability to deliver a late verdict for a request that returned
/// [`Verdict::Pending`].
///
/// Dropping a completer without calling [`finish`](Self::finish) abandons the
/// request; the host never hears back. That is the intended path when the
/// requesting client disconnects while a decision is pending.
pub struct AsyncCompleter {
    complete: Option<CompleteFn>,
}

impl AsyncCompleter {
    /// Wrap the host callback that accepts the late verdict.
    pub fn new(complete: impl FnOnce(&AccessRequest, bool) + Send + Sync + 'static) -> Self {
        Self {
            complete: Some(Box::new(complete)),
        }
    }

    /// A completer that discards the verdict. Used when the hook machinery
    /// is re-entered for a check that cannot suspend.
    pub fn discard() -> Self {
        Self { complete: None }
    }

    /// Deliver the verdict.
    pub fn finish(mut self, request: &AccessRequest, granted: bool) {
        if let Some(complete) = self.complete.take() {
            complete(request, granted);
        }
    }
}

impl fmt::Debug for AsyncCompleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCompleter")
            .field("armed", &self.complete.is_some())
            .finish()
    }
}
