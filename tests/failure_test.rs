use remote_objects::{
    ApiDescriptor, InMemoryStore, PersistedStore, PropertyModifier, RemoteObjectsError,
    ReplicaEvent, ReplicaState, SimpleSource, Value,
};
use std::sync::Arc;
use test_utils::{thermostat_descriptor, Mesh, Thermostat, TARGET};

const REGISTRY: &str = "reg:1";

/// Registry host plus two attached nodes.
fn registry_mesh() -> (Mesh, usize, usize, usize) {
    let mut mesh = Mesh::new();
    let reg = mesh.add_node(REGISTRY);
    let a = mesh.add_node("a:1");
    let b = mesh.add_node("b:1");
    mesh.node(reg).host_registry().unwrap();
    mesh.node(a).attach_registry(REGISTRY).unwrap();
    mesh.node(b).attach_registry(REGISTRY).unwrap();
    mesh.pump();
    (mesh, reg, a, b)
}

#[test]
fn test_duplicate_name_keeps_first_registration() {
    let (mut mesh, reg, a, b) = registry_mesh();
    assert_eq!(mesh.node(a).registry_state(), Some(ReplicaState::Valid));

    mesh.node(a)
        .enable_remoting("temp.Source", Box::new(Thermostat::new()))
        .unwrap();
    mesh.pump();
    mesh.node(b)
        .enable_remoting("temp.Source", Box::new(Thermostat::new()))
        .unwrap();
    mesh.pump();

    for node in [reg, a, b] {
        let locations = mesh.node(node).source_locations();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations["temp.Source"].endpoint, "a:1");
    }
    // B keeps exporting it locally; only the registration was rejected.
    assert!(mesh.node(b).source("temp.Source").is_some());
}

#[test]
fn test_reconnect_drops_name_taken_meanwhile() {
    let (mut mesh, reg, a, b) = registry_mesh();
    mesh.node(a)
        .enable_remoting("temp.Source", Box::new(Thermostat::new()))
        .unwrap();
    mesh.pump();

    // The host forgets entries of a closed channel.
    mesh.disconnect(a, reg);
    mesh.pump();
    assert!(mesh.node(reg).source_locations().is_empty());
    assert_eq!(mesh.node(a).registry_state(), Some(ReplicaState::Suspect));

    mesh.node(b)
        .enable_remoting("temp.Source", Box::new(Thermostat::new()))
        .unwrap();
    mesh.pump();
    assert_eq!(mesh.node(reg).source_locations()["temp.Source"].endpoint, "b:1");

    mesh.retry_dials();
    assert_eq!(mesh.node(a).registry_state(), Some(ReplicaState::Valid));
    let locations = mesh.node(reg).source_locations();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations["temp.Source"].endpoint, "b:1");
    let hosted = mesh.node(a).registry_replica().unwrap().hosted_sources().clone();
    assert!(!hosted.contains_key("temp.Source"));
}

#[test]
fn test_reconnect_replays_hosted_sources_once() {
    let (mut mesh, reg, a, _) = registry_mesh();
    mesh.node(a)
        .enable_remoting("temp.Source", Box::new(Thermostat::new()))
        .unwrap();
    mesh.pump();
    for _ in 0..3 {
        mesh.disconnect(a, reg);
        mesh.pump();
        mesh.retry_dials();
    }
    let locations = mesh.node(reg).source_locations();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations["temp.Source"].endpoint, "a:1");
}

#[test]
fn test_signature_mismatch_is_terminal() {
    let mut mesh = Mesh::new();
    let a = mesh.add_node("a:1");
    let c = mesh.add_node("c:1");
    mesh.node(a)
        .enable_remoting("thermo", Box::new(Thermostat::new()))
        .unwrap();

    let skewed = ApiDescriptor::builder("Thermostat")
        .property("target", "double", PropertyModifier::ReadWrite, 20.0)
        .property("humidity", "double", PropertyModifier::ReadOnly, 0.0)
        .build();
    mesh.node(c).acquire("thermo", skewed).unwrap();
    mesh.connect(c, a);
    mesh.pump();

    assert_eq!(
        mesh.node(c).replica_state("thermo"),
        Some(ReplicaState::SignatureMismatch)
    );
    assert!(mesh.node(a).source("thermo").unwrap().bound_channels().next().is_none());

    // A new Hello does not restart the binding.
    mesh.node(a)
        .enable_remoting("other", Box::new(SimpleSource::new(thermostat_descriptor())))
        .unwrap();
    mesh.pump();
    assert_eq!(
        mesh.node(c).replica_state("thermo"),
        Some(ReplicaState::SignatureMismatch)
    );
}

#[test]
fn test_channel_loss_rejects_pending_calls() {
    let mut mesh = Mesh::new();
    let a = mesh.add_node("a:1");
    let c = mesh.add_node("c:1");
    mesh.node(a)
        .enable_remoting("thermo", Box::new(Thermostat::new()))
        .unwrap();
    mesh.node(c).acquire("thermo", thermostat_descriptor()).unwrap();
    mesh.connect(c, a);
    mesh.pump();
    assert_eq!(mesh.node(c).replica_state("thermo"), Some(ReplicaState::Valid));

    let mut pending = mesh
        .node(c)
        .call("thermo", "boost", vec![Value::Double(2.0)])
        .unwrap()
        .expect("boost returns a value");
    assert!(pending.try_result().is_none());

    mesh.disconnect(c, a);
    assert!(matches!(
        pending.try_result(),
        Some(Err(RemoteObjectsError::Disconnected))
    ));
    let replica = mesh.node(c).replica("thermo").unwrap();
    assert_eq!(replica.state(), ReplicaState::Suspect);
    assert_eq!(replica.property(TARGET), Some(&Value::Double(20.0)));
    assert!(matches!(
        mesh.node(c).set_property("thermo", "target", 25.0),
        Err(RemoteObjectsError::NotValid { .. })
    ));

    // Reconnect: back to Valid, initialized only once.
    mesh.node(c).replica_mut("thermo").unwrap().take_events();
    mesh.connect(c, a);
    mesh.pump();
    let events = mesh.node(c).replica_mut("thermo").unwrap().take_events();
    assert_eq!(mesh.node(c).replica_state("thermo"), Some(ReplicaState::Valid));
    assert!(events.contains(&ReplicaEvent::StateChanged {
        from: ReplicaState::Suspect,
        to: ReplicaState::Handshaking
    }));
    assert!(!events.contains(&ReplicaEvent::Initialized));
}

#[test]
fn test_source_side_failure_reaches_caller() {
    let mut mesh = Mesh::new();
    let a = mesh.add_node("a:1");
    let c = mesh.add_node("c:1");
    mesh.node(a)
        .enable_remoting("thermo", Box::new(Thermostat::new()))
        .unwrap();
    mesh.node(c).acquire("thermo", thermostat_descriptor()).unwrap();
    mesh.connect(c, a);
    mesh.pump();

    let mut pending = mesh
        .node(c)
        .call("thermo", "boost", vec![Value::from("lots")])
        .unwrap()
        .unwrap();
    mesh.pump();
    // Non-numeric delta falls back to +1.
    assert_eq!(pending.try_result().unwrap().unwrap(), Value::Double(21.0));

    assert!(matches!(
        mesh.node(c).set_property("thermo", "current", 40.0),
        Err(RemoteObjectsError::NotWritable { .. })
    ));
    assert!(matches!(
        mesh.node(c).call("thermo", "explode", vec![]),
        Err(RemoteObjectsError::UnknownMethod { .. })
    ));
}

#[test]
fn test_disabled_source_returns_replica_to_uninitialized() {
    let mut mesh = Mesh::new();
    let a = mesh.add_node("a:1");
    let c = mesh.add_node("c:1");
    mesh.node(a)
        .enable_remoting("thermo", Box::new(Thermostat::new()))
        .unwrap();
    mesh.node(c).acquire("thermo", thermostat_descriptor()).unwrap();
    mesh.connect(c, a);
    mesh.pump();

    assert!(mesh.node(a).disable_remoting("thermo"));
    mesh.pump();
    let replica = mesh.node(c).replica("thermo").unwrap();
    assert_eq!(replica.state(), ReplicaState::Uninitialized);
    assert_eq!(replica.property(TARGET), Some(&Value::Double(20.0)));

    // Exported again: the replica re-binds from the peer's Hello.
    mesh.node(a)
        .enable_remoting("thermo", Box::new(Thermostat::new()))
        .unwrap();
    mesh.pump();
    assert_eq!(mesh.node(c).replica_state("thermo"), Some(ReplicaState::Valid));
}

#[test]
fn test_unreachable_endpoint_is_retried() {
    let mut mesh = Mesh::new();
    let b = mesh.add_node("b:1");
    let reg = mesh.add_node(REGISTRY);
    mesh.set_offline(REGISTRY, true);
    mesh.node(reg).host_registry().unwrap();
    mesh.node(b).attach_registry(REGISTRY).unwrap();
    mesh.pump();
    assert_eq!(mesh.parked_dials(), 1);
    assert_eq!(mesh.node(b).registry_state(), Some(ReplicaState::Uninitialized));

    mesh.set_offline(REGISTRY, false);
    mesh.retry_dials();
    assert_eq!(mesh.node(b).registry_state(), Some(ReplicaState::Valid));
}

#[test]
fn test_persisted_property_survives_release() {
    let descriptor = ApiDescriptor::builder("Lamp")
        .property("brightness", "int", PropertyModifier::ReadWrite, 0i64)
        .persisted()
        .property("on", "bool", PropertyModifier::ReadWrite, false)
        .build();
    let store: Arc<dyn PersistedStore> = Arc::new(InMemoryStore::new());

    let mut mesh = Mesh::new();
    let a = mesh.add_node("a:1");
    let c = mesh.add_node("c:1");
    mesh.node(c).set_store(Arc::clone(&store));
    mesh.node(a)
        .enable_remoting(
            "lamp",
            Box::new(SimpleSource::new(Arc::clone(&descriptor)).with_value("brightness", 70i64)),
        )
        .unwrap();
    mesh.node(c).acquire("lamp", Arc::clone(&descriptor)).unwrap();
    mesh.connect(c, a);
    mesh.pump();
    assert_eq!(
        mesh.node(c).replica("lamp").unwrap().property_by_name("brightness"),
        Some(&Value::Int(70))
    );

    assert!(mesh.node(c).release("lamp"));
    mesh.pump();
    let saved = store
        .load("Lamp", &descriptor.signature_hex())
        .unwrap()
        .unwrap();
    assert_eq!(saved.get("brightness"), Some(&Value::Int(70)));
    assert!(!saved.contains_key("on"));

    // A fresh replica starts from the saved value before it binds.
    mesh.disconnect(c, a);
    mesh.node(c).acquire("lamp", Arc::clone(&descriptor)).unwrap();
    assert_eq!(
        mesh.node(c).replica("lamp").unwrap().property_by_name("brightness"),
        Some(&Value::Int(70))
    );
}
