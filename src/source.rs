//! Source side of an object binding.
//!
//! A [`SourceExporter`] owns one local [`SourceObject`] and the set of
//! channels with a bound replica. Incoming `Handshake`/`Invoke` packets are
//! applied to the object; every change the object reports through its
//! [`Notifier`] is turned into `PropertyChanged`/`Signal` packets for all
//! bound channels. Outgoing packets are queued and drained with
//! [`SourceExporter::take_outgoing`].

use crate::descriptor::ApiDescriptor;
use crate::error::{RemoteObjectsError, Result};
use crate::packet::{CallOutcome, HandshakeStatus, InvokeKind, Packet};
use crate::types::{ChannelId, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A change reported by a source object while handling a call or update.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    PropertyChanged(usize),
    Signal { index: usize, args: Vec<Value> },
}

/// Collects change notifications emitted by a [`SourceObject`].
#[derive(Debug, Default)]
pub struct Notifier {
    events: Vec<SourceEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property_changed(&mut self, index: usize) {
        self.events.push(SourceEvent::PropertyChanged(index));
    }

    pub fn emit(&mut self, signal: usize, args: Vec<Value>) {
        self.events.push(SourceEvent::Signal {
            index: signal,
            args,
        });
    }

    pub fn events(&self) -> &[SourceEvent] {
        &self.events
    }

    fn drain(&mut self) -> Vec<SourceEvent> {
        std::mem::take(&mut self.events)
    }
}

/// The object exposed by a source binding.
///
/// Members are addressed by their index in [`SourceObject::descriptor`].
/// Implementations report every state change through the [`Notifier`]; the
/// exporter never diffs values on its own.
pub trait SourceObject: Send {
    fn descriptor(&self) -> Arc<ApiDescriptor>;

    fn property(&self, index: usize) -> Value;

    /// Authoritative setter, available to local code for every property.
    fn set_property(&mut self, index: usize, value: Value, notifier: &mut Notifier) -> Result<()>;

    /// Setter reached by replica writes. The exporter only calls it for
    /// properties whose modifier allows writes from a replica; the default
    /// forwards to [`SourceObject::set_property`].
    fn write_property(
        &mut self,
        index: usize,
        value: Value,
        notifier: &mut Notifier,
    ) -> Result<()> {
        self.set_property(index, value, notifier)
    }

    fn invoke(&mut self, method: usize, args: Vec<Value>, notifier: &mut Notifier)
        -> Result<Value>;
}

/// View over a [`SimpleSource`]'s values handed to method handlers.
pub struct PropertyBag<'a> {
    descriptor: &'a ApiDescriptor,
    values: &'a mut Vec<Value>,
    notifier: &'a mut Notifier,
}

impl PropertyBag<'_> {
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.values.get(self.descriptor.property_index(name)?)
    }

    /// Stores the value and notifies when it differs from the current one.
    pub fn set(&mut self, index: usize, value: Value) -> Result<()> {
        store_value(self.descriptor, self.values, index, value, self.notifier)
    }

    pub fn emit(&mut self, signal: usize, args: Vec<Value>) {
        self.notifier.emit(signal, args);
    }
}

fn store_value(
    descriptor: &ApiDescriptor,
    values: &mut [Value],
    index: usize,
    value: Value,
    notifier: &mut Notifier,
) -> Result<()> {
    let def = descriptor
        .property(index)
        .ok_or_else(|| RemoteObjectsError::UnknownProperty {
            type_name: descriptor.type_name().to_string(),
            index,
        })?;
    if !def.modifier.notifies() {
        return Err(RemoteObjectsError::NotWritable {
            type_name: descriptor.type_name().to_string(),
            name: def.name.clone(),
        });
    }
    if values[index] != value {
        values[index] = value;
        notifier.property_changed(index);
    }
    Ok(())
}

pub type MethodHandler =
    Box<dyn FnMut(&mut PropertyBag<'_>, Vec<Value>) -> Result<Value> + Send>;

/// Generic property-bag source: stored values plus optional method handlers.
///
/// Methods without a handler return `Value::Null`.
pub struct SimpleSource {
    descriptor: Arc<ApiDescriptor>,
    values: Vec<Value>,
    handlers: HashMap<usize, MethodHandler>,
}

impl SimpleSource {
    pub fn new(descriptor: Arc<ApiDescriptor>) -> Self {
        let values = descriptor
            .properties()
            .iter()
            .map(|p| p.default.clone())
            .collect();
        Self {
            descriptor,
            values,
            handlers: HashMap::new(),
        }
    }

    /// Overrides the initial value of a property, before the source is exported.
    pub fn with_value(mut self, name: &str, value: impl Into<Value>) -> Self {
        match self.descriptor.property_index(name) {
            Some(index) => self.values[index] = value.into(),
            None => warn!(
                type_name = self.descriptor.type_name(),
                property = name,
                "ignoring initial value for unknown property"
            ),
        }
        self
    }

    pub fn on_method<F>(mut self, name: &str, handler: F) -> Self
    where
        F: FnMut(&mut PropertyBag<'_>, Vec<Value>) -> Result<Value> + Send + 'static,
    {
        match self.descriptor.method_index(name) {
            Some(index) => {
                self.handlers.insert(index, Box::new(handler));
            }
            None => warn!(
                type_name = self.descriptor.type_name(),
                method = name,
                "ignoring handler for unknown method"
            ),
        }
        self
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(self.descriptor.property_index(name)?)
    }
}

impl SourceObject for SimpleSource {
    fn descriptor(&self) -> Arc<ApiDescriptor> {
        Arc::clone(&self.descriptor)
    }

    fn property(&self, index: usize) -> Value {
        self.values.get(index).cloned().unwrap_or_default()
    }

    fn set_property(&mut self, index: usize, value: Value, notifier: &mut Notifier) -> Result<()> {
        store_value(&self.descriptor, &mut self.values, index, value, notifier)
    }

    fn invoke(
        &mut self,
        method: usize,
        args: Vec<Value>,
        notifier: &mut Notifier,
    ) -> Result<Value> {
        if self.descriptor.method(method).is_none() {
            return Err(RemoteObjectsError::UnknownMethod {
                type_name: self.descriptor.type_name().to_string(),
                index: method,
            });
        }
        match self.handlers.get_mut(&method) {
            Some(handler) => {
                let mut bag = PropertyBag {
                    descriptor: &self.descriptor,
                    values: &mut self.values,
                    notifier,
                };
                handler(&mut bag, args)
            }
            None => Ok(Value::Null),
        }
    }
}

/// Binds a local object to its descriptor and the channels replicating it.
pub struct SourceExporter {
    name: String,
    descriptor: Arc<ApiDescriptor>,
    object: Box<dyn SourceObject>,
    channels: BTreeSet<ChannelId>,
    outgoing: Vec<(ChannelId, Packet)>,
}

impl SourceExporter {
    pub fn new(name: impl Into<String>, object: Box<dyn SourceObject>) -> Self {
        let descriptor = object.descriptor();
        Self {
            name: name.into(),
            descriptor,
            object,
            channels: BTreeSet::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &Arc<ApiDescriptor> {
        &self.descriptor
    }

    pub fn object(&self) -> &dyn SourceObject {
        self.object.as_ref()
    }

    pub fn bound_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.iter().copied()
    }

    pub fn is_bound(&self, channel: ChannelId) -> bool {
        self.channels.contains(&channel)
    }

    /// Current value of every property, in descriptor order.
    pub fn initial_values(&self) -> Vec<Value> {
        (0..self.descriptor.properties().len())
            .map(|i| self.object.property(i))
            .collect()
    }

    pub fn take_outgoing(&mut self) -> Vec<(ChannelId, Packet)> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn handle_packet(&mut self, channel: ChannelId, packet: Packet) {
        match packet {
            Packet::Handshake {
                type_name,
                signature,
                ..
            } => self.handle_handshake(channel, &type_name, &signature),
            Packet::Invoke {
                kind,
                index,
                args,
                call_id,
                ..
            } => self.handle_invoke(channel, kind, index as usize, args, call_id),
            Packet::Release { .. } => self.release(channel),
            other => debug!(
                source = %self.name,
                %channel,
                packet = ?other,
                "ignoring packet not addressed to a source"
            ),
        }
    }

    pub fn handle_handshake(&mut self, channel: ChannelId, type_name: &str, signature: &str) {
        let expected = self.descriptor.signature_hex();
        if signature != expected {
            error!(
                source = %self.name,
                %channel,
                type_name,
                expected = %expected,
                actual = signature,
                "refusing replica with a different api signature"
            );
            self.outgoing.push((
                channel,
                Packet::HandshakeAck {
                    name: self.name.clone(),
                    status: HandshakeStatus::Mismatch { expected },
                },
            ));
            return;
        }

        self.channels.insert(channel);
        info!(source = %self.name, %channel, "replica bound");
        self.outgoing.push((
            channel,
            Packet::HandshakeAck {
                name: self.name.clone(),
                status: HandshakeStatus::Ok,
            },
        ));
        self.outgoing.push((
            channel,
            Packet::InitialState {
                name: self.name.clone(),
                values: self.initial_values(),
            },
        ));
    }

    pub fn handle_invoke(
        &mut self,
        channel: ChannelId,
        kind: InvokeKind,
        index: usize,
        args: Vec<Value>,
        call_id: Option<u64>,
    ) {
        if !self.channels.contains(&channel) {
            warn!(source = %self.name, %channel, "invoke from a channel without a binding");
            self.reply(
                channel,
                call_id,
                Err(RemoteObjectsError::NotValid {
                    name: self.name.clone(),
                    state: "unbound".to_string(),
                }),
            );
            return;
        }

        let mut notifier = Notifier::new();
        let result = match kind {
            InvokeKind::Method => self.object.invoke(index, args, &mut notifier),
            InvokeKind::WriteProperty => self
                .check_writable(index)
                .and_then(|()| {
                    let value = args.into_iter().next().unwrap_or_default();
                    self.object.write_property(index, value, &mut notifier)
                })
                .map(|()| Value::Null),
        };
        if let Err(e) = &result {
            warn!(source = %self.name, %channel, ?kind, index, error = %e, "invoke rejected");
        }

        // Changes caused by the call reach the replica before its reply.
        self.flush(notifier);
        self.reply(channel, call_id, result);
    }

    fn check_writable(&self, index: usize) -> Result<()> {
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
        Ok(())
    }

    fn reply(&mut self, channel: ChannelId, call_id: Option<u64>, result: Result<Value>) {
        let Some(call_id) = call_id else {
            return;
        };
        let outcome = match result {
            Ok(value) => CallOutcome::Ok(value),
            Err(e) => CallOutcome::Err(e.to_string()),
        };
        self.outgoing.push((
            channel,
            Packet::Reply {
                name: self.name.clone(),
                call_id,
                outcome,
            },
        ));
    }

    /// Runs local code against the object and publishes what it reports.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut dyn SourceObject, &mut Notifier) -> R) -> R {
        let mut notifier = Notifier::new();
        let result = f(self.object.as_mut(), &mut notifier);
        self.flush(notifier);
        result
    }

    fn flush(&mut self, mut notifier: Notifier) {
        for event in notifier.drain() {
            let packet = match event {
                SourceEvent::PropertyChanged(index) => {
                    let Some(def) = self.descriptor.property(index) else {
                        warn!(source = %self.name, index, "change reported for unknown property");
                        continue;
                    };
                    if !def.modifier.notifies() {
                        warn!(
                            source = %self.name,
                            property = %def.name,
                            "ignoring change of a constant property"
                        );
                        continue;
                    }
                    Packet::PropertyChanged {
                        name: self.name.clone(),
                        index: index as u32,
                        value: self.object.property(index),
                    }
                }
                SourceEvent::Signal { index, args } => {
                    if index >= self.descriptor.signals().len() {
                        warn!(source = %self.name, index, "emit of unknown signal");
                        continue;
                    }
                    Packet::Signal {
                        name: self.name.clone(),
                        index: index as u32,
                        args,
                    }
                }
            };
            for channel in &self.channels {
                self.outgoing.push((*channel, packet.clone()));
            }
        }
    }

    pub fn release(&mut self, channel: ChannelId) {
        if self.channels.remove(&channel) {
            debug!(source = %self.name, %channel, "replica released");
        }
    }

    /// Drops the binding of a closed channel. Returns whether one existed.
    pub fn channel_closed(&mut self, channel: ChannelId) -> bool {
        self.outgoing.retain(|(c, _)| *c != channel);
        self.channels.remove(&channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PropertyModifier;

    fn counter() -> Arc<ApiDescriptor> {
        ApiDescriptor::builder("Counter")
            .property("count", "int", PropertyModifier::ReadWrite, 0)
            .property("label", "QString", PropertyModifier::Constant, "counter")
            .property("total", "int", PropertyModifier::ReadOnly, 0)
            .signal("wrapped", &[])
            .method("increment", &[("by", "int")], Some("int"))
            .method("clear", &[], None)
            .build()
    }

    fn exporter() -> SourceExporter {
        let source = SimpleSource::new(counter())
            .with_value("label", "kitchen")
            .on_method("increment", |bag, args| {
                let by = args.first().and_then(Value::as_i64).unwrap_or(1);
                let next = bag.get(0).and_then(Value::as_i64).unwrap_or(0) + by;
                bag.set(0, Value::Int(next))?;
                if next > 10 {
                    bag.emit(0, vec![]);
                }
                Ok(Value::Int(next))
            });
        SourceExporter::new("counter", Box::new(source))
    }

    fn bind(exporter: &mut SourceExporter, channel: ChannelId) {
        let signature = exporter.descriptor().signature_hex();
        exporter.handle_handshake(channel, "Counter", &signature);
    }

    #[test]
    fn test_handshake_sends_ack_then_initial_state() {
        let mut exporter = exporter();
        bind(&mut exporter, ChannelId(1));
        let out = exporter.take_outgoing();
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0].1,
            Packet::HandshakeAck { status: HandshakeStatus::Ok, .. }
        ));
        assert_eq!(
            out[1].1,
            Packet::InitialState {
                name: "counter".into(),
                values: vec![Value::Int(0), Value::from("kitchen"), Value::Int(0)],
            }
        );
        assert!(exporter.is_bound(ChannelId(1)));
    }

    #[test]
    fn test_signature_mismatch_refuses_binding() {
        let mut exporter = exporter();
        exporter.handle_handshake(ChannelId(1), "Counter", "deadbeef");
        let out = exporter.take_outgoing();
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0].1,
            Packet::HandshakeAck { status: HandshakeStatus::Mismatch { .. }, .. }
        ));
        assert!(!exporter.is_bound(ChannelId(1)));
    }

    #[test]
    fn test_invoke_changes_precede_reply() {
        let mut exporter = exporter();
        bind(&mut exporter, ChannelId(1));
        bind(&mut exporter, ChannelId(2));
        exporter.take_outgoing();

        exporter.handle_invoke(ChannelId(1), InvokeKind::Method, 0, vec![Value::Int(11)], Some(4));
        let out = exporter.take_outgoing();
        let kinds: Vec<_> = out
            .iter()
            .map(|(c, p)| match p {
                Packet::PropertyChanged { .. } => (c.0, "changed"),
                Packet::Signal { .. } => (c.0, "signal"),
                Packet::Reply { .. } => (c.0, "reply"),
                _ => (c.0, "other"),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                (1, "changed"),
                (2, "changed"),
                (1, "signal"),
                (2, "signal"),
                (1, "reply")
            ]
        );
        assert_eq!(
            out[4].1,
            Packet::Reply {
                name: "counter".into(),
                call_id: 4,
                outcome: CallOutcome::Ok(Value::Int(11)),
            }
        );
    }

    #[test]
    fn test_write_to_read_only_rejected() {
        let mut exporter = exporter();
        bind(&mut exporter, ChannelId(1));
        exporter.take_outgoing();

        exporter.handle_invoke(
            ChannelId(1),
            InvokeKind::WriteProperty,
            2,
            vec![Value::Int(5)],
            Some(1),
        );
        let out = exporter.take_outgoing();
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0].1,
            Packet::Reply { outcome: CallOutcome::Err(msg), .. } if msg.contains("not writable")
        ));
        assert_eq!(exporter.object().property(2), Value::Int(0));
    }

    #[test]
    fn test_write_without_change_sends_nothing() {
        let mut exporter = exporter();
        bind(&mut exporter, ChannelId(1));
        exporter.take_outgoing();

        exporter.handle_invoke(ChannelId(1), InvokeKind::WriteProperty, 0, vec![Value::Int(0)], None);
        assert!(exporter.take_outgoing().is_empty());
        exporter.handle_invoke(ChannelId(1), InvokeKind::WriteProperty, 0, vec![Value::Int(3)], None);
        assert_eq!(exporter.take_outgoing().len(), 1);
    }

    #[test]
    fn test_update_without_replicas_queues_nothing() {
        let mut exporter = exporter();
        exporter
            .update(|obj, n| obj.set_property(0, Value::Int(9), n))
            .unwrap();
        assert!(exporter.take_outgoing().is_empty());
        assert_eq!(exporter.object().property(0), Value::Int(9));
    }

    #[test]
    fn test_constant_cannot_change() {
        let mut exporter = exporter();
        let err = exporter
            .update(|obj, n| obj.set_property(1, Value::from("other"), n))
            .unwrap_err();
        assert!(matches!(err, RemoteObjectsError::NotWritable { .. }));
    }

    #[test]
    fn test_unbound_invoke_rejected() {
        let mut exporter = exporter();
        exporter.handle_invoke(ChannelId(3), InvokeKind::Method, 1, vec![], Some(2));
        let out = exporter.take_outgoing();
        assert!(matches!(
            &out[0].1,
            Packet::Reply { outcome: CallOutcome::Err(_), call_id: 2, .. }
        ));
    }

    #[test]
    fn test_channel_closed_drops_binding_and_queue() {
        let mut exporter = exporter();
        bind(&mut exporter, ChannelId(1));
        assert!(exporter.channel_closed(ChannelId(1)));
        assert!(exporter.take_outgoing().is_empty());
        assert!(!exporter.channel_closed(ChannelId(1)));
    }
}
