// src/events.rs
//
// Typed events emitted to the presentation layer.
//
// Every notification the client and server produce goes through an
// `EventEmitter`. Hosts choose the sink: a channel for embedding, the log
// for the CLI, or nothing at all.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::io::{ClientState, RegisterData, RegisterType, ScanUnitIdResult, Transaction};

// ============================================================================
// Payloads
// ============================================================================

/// Severity of a toast-style backend message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageVariant {
    Success,
    Info,
    Warning,
    Error,
}

/// Free-text notification for the user.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BackendMessage {
    pub message: String,
    pub variant: MessageVariant,
}

/// A server register word changed (local configuration, generator tick or remote write).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegisterValuePayload {
    /// Server instance id
    pub uuid: String,
    pub unit_id: u8,
    pub register_type: RegisterType,
    pub address: u16,
    pub raw: u16,
}

/// A server coil or discrete input changed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BooleanValuePayload {
    /// Server instance id
    pub uuid: String,
    pub unit_id: u8,
    pub register_type: RegisterType,
    pub address: u16,
    pub value: bool,
}

/// Scan progress, 0-100.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScanProgressPayload {
    pub progress: f64,
}

// ============================================================================
// Event
// ============================================================================

/// Everything the backend can tell the presentation layer.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum BackendEvent {
    BackendMessage(BackendMessage),
    ClientState(ClientState),
    RegisterData(Vec<RegisterData>),
    Transaction(Transaction),
    ScanUnitIdResult(ScanUnitIdResult),
    ScanProgress(ScanProgressPayload),
    RegisterValue(RegisterValuePayload),
    BooleanValue(BooleanValuePayload),
}

impl BackendEvent {
    /// Event name as seen by listeners.
    pub fn name(&self) -> &'static str {
        match self {
            BackendEvent::BackendMessage(_) => "backend-message",
            BackendEvent::ClientState(_) => "client-state",
            BackendEvent::RegisterData(_) => "register-data",
            BackendEvent::Transaction(_) => "transaction",
            BackendEvent::ScanUnitIdResult(_) => "scan-unit-id-result",
            BackendEvent::ScanProgress(_) => "scan-progress",
            BackendEvent::RegisterValue(_) => "register-value",
            BackendEvent::BooleanValue(_) => "boolean-value",
        }
    }
}

// ============================================================================
// Emitters
// ============================================================================

/// Sink for backend events. Implementations must not block.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: BackendEvent);
}

pub type SharedEmitter = Arc<dyn EventEmitter>;

/// Forwards events into an unbounded tokio channel.
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<BackendEvent>,
}

impl ChannelEmitter {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BackendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventEmitter for ChannelEmitter {
    fn emit(&self, event: BackendEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

/// Writes every event to the log as `[event-name] {json}`.
pub struct LogEmitter;

impl EventEmitter for LogEmitter {
    fn emit(&self, event: BackendEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tlog!("[{}] {}", event.name(), json),
            Err(e) => tlog!("[{}] <unserialisable: {}>", event.name(), e),
        }
    }
}

/// Drops every event.
pub struct NullEmitter;

impl EventEmitter for NullEmitter {
    fn emit(&self, _event: BackendEvent) {}
}

/// Emit a backend message and mirror it to the log.
pub fn emit_message(
    emitter: &dyn EventEmitter,
    variant: MessageVariant,
    component: &str,
    message: impl Into<String>,
) {
    let message = message.into();
    tlog!("[{}] {:?}: {}", component, variant, message);
    emitter.emit(BackendEvent::BackendMessage(BackendMessage { message, variant }));
}
