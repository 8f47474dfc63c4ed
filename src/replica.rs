//! Client-side proxy of a remote source.
//!
//! ```text
//!  Uninitialized ──start_handshake──▶ Handshaking ──InitialState──▶ Valid
//!        ▲                               │   │                        │
//!        └────────── NoSuchSource ───────┘   └──▶ SignatureMismatch   │
//!                                                                    │
//!  Handshaking ◀──start_handshake── Suspect ◀────channel_lost────────┘
//! ```
//!
//! A replica never applies its own writes. Property writes and method calls
//! are queued as `Invoke` packets; the new value arrives through the normal
//! `PropertyChanged` path once the source accepted (and possibly adjusted) it.

use crate::descriptor::ApiDescriptor;
use crate::error::{RemoteObjectsError, Result};
use crate::packet::{CallOutcome, HandshakeStatus, InvokeKind, Packet};
use crate::persist::{PersistedStore, PersistedValues};
use crate::types::Value;
use futures::channel::oneshot;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaState {
    Uninitialized,
    Handshaking,
    Valid,
    SignatureMismatch,
    /// The channel was lost; values are the last known ones.
    Suspect,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicaState::Uninitialized => "Uninitialized",
            ReplicaState::Handshaking => "Handshaking",
            ReplicaState::Valid => "Valid",
            ReplicaState::SignatureMismatch => "SignatureMismatch",
            ReplicaState::Suspect => "Suspect",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    StateChanged {
        from: ReplicaState,
        to: ReplicaState,
    },
    /// First transition to `Valid`.
    Initialized,
    PropertyChanged {
        index: usize,
        value: Value,
    },
    Signal {
        index: usize,
        args: Vec<Value>,
    },
}

/// Reply to a non-void method call.
///
/// Resolves with the source's return value, `Remote` if the source-side
/// call failed, or `Disconnected` if the binding went away first.
#[derive(Debug)]
pub struct PendingCall {
    call_id: u64,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Non-blocking check. `None` while the reply is outstanding.
    pub fn try_result(&mut self) -> Option<Result<Value>> {
        match self.rx.try_recv() {
            Ok(Some(result)) => Some(result),
            Ok(None) => None,
            Err(oneshot::Canceled) => Some(Err(RemoteObjectsError::Disconnected)),
        }
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RemoteObjectsError::Disconnected)))
    }
}

pub struct Replica {
    name: String,
    descriptor: Arc<ApiDescriptor>,
    state: ReplicaState,
    values: Vec<Value>,
    pending: HashMap<u64, oneshot::Sender<Result<Value>>>,
    next_call_id: u64,
    initialized_once: bool,
    constants_announced: bool,
    events: Vec<ReplicaEvent>,
    outgoing: Vec<Packet>,
    store: Option<Arc<dyn PersistedStore>>,
}

impl Replica {
    pub fn new(name: impl Into<String>, descriptor: Arc<ApiDescriptor>) -> Self {
        let values = descriptor
            .properties()
            .iter()
            .map(|p| p.default.clone())
            .collect();
        Self {
            name: name.into(),
            descriptor,
            state: ReplicaState::Uninitialized,
            values,
            pending: HashMap::new(),
            next_call_id: 1,
            initialized_once: false,
            constants_announced: false,
            events: Vec::new(),
            outgoing: Vec::new(),
            store: None,
        }
    }

    /// Seeds persisted properties from `store`; they are written back on drop.
    pub fn with_store(mut self, store: Arc<dyn PersistedStore>) -> Self {
        if self.descriptor.has_persisted_properties() {
            let signature = self.descriptor.signature_hex();
            match store.load(self.descriptor.type_name(), &signature) {
                Ok(Some(saved)) => self.seed(saved),
                Ok(None) => {}
                Err(e) => warn!(replica = %self.name, error = %e, "failed to load persisted properties"),
            }
        }
        self.store = Some(store);
        self
    }

    fn seed(&mut self, saved: PersistedValues) {
        for (index, def) in self.descriptor.properties().iter().enumerate() {
            if !def.persisted {
                continue;
            }
            if let Some(value) = saved.get(&def.name) {
                self.values[index] = value.clone();
            }
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if !self.descriptor.has_persisted_properties() {
            return Ok(());
        }
        let values: PersistedValues = self
            .descriptor
            .properties()
            .iter()
            .zip(&self.values)
            .filter(|(def, _)| def.persisted)
            .map(|(def, value)| (def.name.clone(), value.clone()))
            .collect();
        store.save(
            self.descriptor.type_name(),
            &self.descriptor.signature_hex(),
            values,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &Arc<ApiDescriptor> {
        &self.descriptor
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn is_valid(&self) -> bool {
        self.state == ReplicaState::Valid
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized_once
    }

    pub fn property(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn property_by_name(&self, name: &str) -> Option<&Value> {
        self.values.get(self.descriptor.property_index(name)?)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn take_events(&mut self) -> Vec<ReplicaEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn take_outgoing(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outgoing)
    }

    fn set_state(&mut self, to: ReplicaState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        debug!(replica = %self.name, %from, %to, "state changed");
        self.events.push(ReplicaEvent::StateChanged { from, to });
    }

    /// Queues the handshake. Only meaningful from `Uninitialized` or `Suspect`.
    pub fn start_handshake(&mut self) {
        match self.state {
            ReplicaState::Uninitialized | ReplicaState::Suspect => {}
            state => {
                debug!(replica = %self.name, %state, "handshake not restarted");
                return;
            }
        }
        self.set_state(ReplicaState::Handshaking);
        self.outgoing.push(Packet::Handshake {
            name: self.name.clone(),
            type_name: self.descriptor.type_name().to_string(),
            signature: self.descriptor.signature_hex(),
        });
    }

    pub fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::HandshakeAck { status, .. } => self.handle_ack(status),
            Packet::InitialState { values, .. } => self.apply_initial_state(values),
            Packet::PropertyChanged { index, value, .. } => {
                self.apply_change(index as usize, value)
            }
            Packet::Signal { index, args, .. } => {
                if self.state != ReplicaState::Valid {
                    debug!(replica = %self.name, index, "signal outside Valid dropped");
                    return;
                }
                self.events.push(ReplicaEvent::Signal {
                    index: index as usize,
                    args,
                });
            }
            Packet::Reply {
                call_id, outcome, ..
            } => self.resolve(call_id, outcome),
            other => debug!(replica = %self.name, packet = ?other, "ignoring packet"),
        }
    }

    fn handle_ack(&mut self, status: HandshakeStatus) {
        match status {
            // Valid only once the initial state is applied.
            HandshakeStatus::Ok => {}
            HandshakeStatus::Mismatch { expected } => {
                error!(
                    replica = %self.name,
                    type_name = self.descriptor.type_name(),
                    expected = %expected,
                    actual = %self.descriptor.signature_hex(),
                    "source refused binding: api signature mismatch"
                );
                self.reject_pending();
                self.set_state(ReplicaState::SignatureMismatch);
            }
            HandshakeStatus::NoSuchSource => {
                info!(replica = %self.name, "peer does not host the source");
                self.reject_pending();
                self.set_state(ReplicaState::Uninitialized);
            }
        }
    }

    fn apply_initial_state(&mut self, values: Vec<Value>) {
        if self.state != ReplicaState::Handshaking {
            warn!(replica = %self.name, state = %self.state, "unexpected initial state");
            return;
        }
        if values.len() != self.values.len() {
            error!(
                replica = %self.name,
                expected = self.values.len(),
                got = values.len(),
                "initial state does not match the descriptor"
            );
            self.set_state(ReplicaState::SignatureMismatch);
            return;
        }

        for (index, value) in values.into_iter().enumerate() {
            let constant = !self.descriptor.properties()[index].modifier.notifies();
            let announce = constant && !self.constants_announced;
            if self.values[index] != value || announce {
                self.values[index] = value.clone();
                self.events.push(ReplicaEvent::PropertyChanged { index, value });
            }
        }
        self.constants_announced = true;

        self.set_state(ReplicaState::Valid);
        if !self.initialized_once {
            self.initialized_once = true;
            info!(replica = %self.name, "replica initialized");
            self.events.push(ReplicaEvent::Initialized);
        }
    }

    fn apply_change(&mut self, index: usize, value: Value) {
        if self.state != ReplicaState::Valid {
            debug!(replica = %self.name, index, "change outside Valid dropped");
            return;
        }
        let Some(slot) = self.values.get_mut(index) else {
            warn!(replica = %self.name, index, "change for unknown property");
            return;
        };
        if *slot != value {
            *slot = value.clone();
            self.events.push(ReplicaEvent::PropertyChanged { index, value });
        }
    }

    /// Local update of a cached property, used by bindings that mirror
    /// registry-scoped packets into a property.
    pub(crate) fn apply_local(&mut self, index: usize, value: Value) {
        if let Some(slot) = self.values.get_mut(index) {
            if *slot != value {
                *slot = value.clone();
                self.events.push(ReplicaEvent::PropertyChanged { index, value });
            }
        }
    }

    pub(crate) fn push_event(&mut self, event: ReplicaEvent) {
        self.events.push(event);
    }

    pub(crate) fn queue(&mut self, packet: Packet) {
        self.outgoing.push(packet);
    }

    fn resolve(&mut self, call_id: u64, outcome: CallOutcome) {
        let Some(tx) = self.pending.remove(&call_id) else {
            debug!(replica = %self.name, call_id, "reply for unknown call");
            return;
        };
        let result = match outcome {
            CallOutcome::Ok(value) => Ok(value),
            CallOutcome::Err(message) => Err(RemoteObjectsError::Remote(message)),
        };
        // The caller may have dropped its PendingCall.
        let _ = tx.send(result);
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.state != ReplicaState::Valid {
            return Err(RemoteObjectsError::NotValid {
                name: self.name.clone(),
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Requests a write of a `ReadWrite`/`ReadPush` property.
    pub fn set_property(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.ensure_valid()?;
        let def = self
            .descriptor
            .property(index)
            .ok_or_else(|| RemoteObjectsError::UnknownProperty {
                type_name: self.descriptor.type_name().to_string(),
                index,
            })?;
        if !def.modifier.writable_from_replica() {
            return Err(RemoteObjectsError::NotWritable {
                type_name: self.descriptor.type_name().to_string(),
                name: def.name.clone(),
            });
        }
        self.outgoing.push(Packet::Invoke {
            name: self.name.clone(),
            kind: InvokeKind::WriteProperty,
            index: index as u32,
            args: vec![value.into()],
            call_id: None,
        });
        Ok(())
    }

    pub fn set_property_by_name(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let index = self.descriptor.property_index(name).ok_or_else(|| {
            RemoteObjectsError::NotWritable {
                type_name: self.descriptor.type_name().to_string(),
                name: name.to_string(),
            }
        })?;
        self.set_property(index, value)
    }

    /// Queues a method call. Non-void methods return a [`PendingCall`].
    pub fn call(&mut self, method: usize, args: Vec<Value>) -> Result<Option<PendingCall>> {
        self.ensure_valid()?;
        let def = self
            .descriptor
            .method(method)
            .ok_or_else(|| RemoteObjectsError::UnknownMethod {
                type_name: self.descriptor.type_name().to_string(),
                index: method,
            })?;

        let pending = if def.return_type.is_some() {
            let call_id = self.next_call_id;
            self.next_call_id += 1;
            let (tx, rx) = oneshot::channel();
            self.pending.insert(call_id, tx);
            Some(PendingCall { call_id, rx })
        } else {
            None
        };

        self.outgoing.push(Packet::Invoke {
            name: self.name.clone(),
            kind: InvokeKind::Method,
            index: method as u32,
            args,
            call_id: pending.as_ref().map(PendingCall::call_id),
        });
        Ok(pending)
    }

    pub fn call_by_name(&mut self, method: &str, args: Vec<Value>) -> Result<Option<PendingCall>> {
        let index =
            self.descriptor
                .method_index(method)
                .ok_or_else(|| RemoteObjectsError::UnknownMethod {
                    type_name: self.descriptor.type_name().to_string(),
                    index: usize::MAX,
                })?;
        self.call(index, args)
    }

    fn reject_pending(&mut self) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(RemoteObjectsError::Disconnected));
        }
    }

    /// The channel carrying this binding went away.
    pub fn channel_lost(&mut self) {
        self.reject_pending();
        self.outgoing.clear();
        match self.state {
            ReplicaState::Valid => self.set_state(ReplicaState::Suspect),
            ReplicaState::Handshaking => {
                let next = if self.initialized_once {
                    ReplicaState::Suspect
                } else {
                    ReplicaState::Uninitialized
                };
                self.set_state(next);
            }
            _ => {}
        }
    }

    /// Tears the binding down and queues a `Release` for the source.
    pub fn shutdown(&mut self) {
        self.reject_pending();
        if matches!(
            self.state,
            ReplicaState::Valid | ReplicaState::Handshaking
        ) {
            self.outgoing.push(Packet::Release {
                name: self.name.clone(),
            });
        }
        if let Err(e) = self.persist() {
            warn!(replica = %self.name, error = %e, "failed to persist properties");
        }
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.reject_pending();
        if let Err(e) = self.persist() {
            warn!(replica = %self.name, error = %e, "failed to persist properties");
        }
    }
}
