use remote_objects::model::{CellData, DISPLAY_ROLE, USER_ROLE};
use remote_objects::types::IndexStep;
use remote_objects::{
    DataState, ItemModel, ModelCacheConfig, ModelEvent, NodeConfig, RemoteObjectsError,
    ReplicaState, TreeModel, Value,
};
use test_utils::Mesh;

const ROWS: &str = "rows";

/// Node 0 exports a one-column table of `rows` integers; node 1 replicates it.
fn table_mesh(rows: u32, config: NodeConfig) -> (Mesh, usize, usize) {
    let mut mesh = Mesh::new();
    let source = mesh.add_node("src:1");
    let client = mesh.add_node_with("cli:1", config);
    let model = TreeModel::table(rows, 1, |row, _| Value::Int(row as i64)).with_role(USER_ROLE, "raw");
    mesh.node(source)
        .enable_model_remoting(ROWS, Box::new(model))
        .unwrap();
    mesh.node(client).acquire_model(ROWS).unwrap();
    mesh.connect(client, source);
    mesh.pump();
    (mesh, source, client)
}

fn display(mesh: &mut Mesh, node: usize, row: u32) -> DataState {
    let replica = mesh.node(node).model_replica_mut(ROWS).unwrap();
    let index = replica.index(replica.root(), row, 0).unwrap();
    replica.data(index, DISPLAY_ROLE).unwrap()
}

#[test]
fn test_prefetch_bounded_by_cache_size() {
    let config = NodeConfig {
        model: ModelCacheConfig::default()
            .with_prefetch(vec![DISPLAY_ROLE])
            .with_cache_size(50),
        ..NodeConfig::default()
    };
    let (mut mesh, _, client) = table_mesh(1000, config);

    let replica = mesh.node(client).model_replica_mut(ROWS).unwrap();
    assert!(replica.is_initialized());
    let root = replica.root();
    assert_eq!(replica.row_count(root), Some(1000));
    assert_eq!(replica.resident_rows(root), 50);
    assert_eq!(replica.role_names().get(&USER_ROLE).map(String::as_str), Some("raw"));

    let first = replica.index(root, 0, 0).unwrap();
    let last = replica.index(root, 49, 0).unwrap();
    assert_eq!(replica.cached_data(first, DISPLAY_ROLE), Some(&Value::Int(0)));
    assert_eq!(replica.cached_data(last, DISPLAY_ROLE), Some(&Value::Int(49)));
}

#[test]
fn test_removed_rows_shift_cached_handles() {
    let (mut mesh, source, client) = table_mesh(30, NodeConfig::default());
    let handles: Vec<_> = {
        let replica = mesh.node(client).model_replica_mut(ROWS).unwrap();
        let root = replica.root();
        let handles: Vec<_> = (0..20).map(|row| replica.index(root, row, 0).unwrap()).collect();
        for handle in &handles {
            replica.data(*handle, DISPLAY_ROLE).unwrap();
        }
        handles
    };
    mesh.pump();

    assert!(mesh
        .node(source)
        .model_exporter_mut(ROWS)
        .unwrap()
        .remove_rows(&[], 2, 9));
    mesh.pump();

    let replica = mesh.node(client).model_replica_mut(ROWS).unwrap();
    assert!(!replica.is_valid_index(handles[5]));
    assert!(matches!(
        replica.data(handles[5], DISPLAY_ROLE),
        Err(RemoteObjectsError::InvalidIndex(_))
    ));
    assert_eq!(replica.row(handles[15]), Some(6));
    assert_eq!(
        replica.data(handles[15], DISPLAY_ROLE).unwrap(),
        DataState::Available(Value::Int(15))
    );
    assert_eq!(replica.row_count(replica.root()), Some(21));
}

#[test]
fn test_concurrent_reads_share_one_fetch() {
    let (mut mesh, _, client) = table_mesh(10, NodeConfig::default());
    for _ in 0..4 {
        assert_eq!(display(&mut mesh, client, 7), DataState::NotYetAvailable);
    }
    let outgoing = mesh.node(client).take_outgoing();
    assert_eq!(outgoing.len(), 1);
    let replica = mesh.node(client).model_replica(ROWS).unwrap();
    assert_eq!(replica.requests_in_flight(), 1);
}

#[test]
fn test_set_data_applied_by_source_and_echoed() {
    let (mut mesh, source, client) = table_mesh(5, NodeConfig::default());
    display(&mut mesh, client, 2);
    mesh.pump();

    let replica = mesh.node(client).model_replica_mut(ROWS).unwrap();
    let index = replica.index(replica.root(), 2, 0).unwrap();
    replica.set_data(index, DISPLAY_ROLE, Value::from("two")).unwrap();
    mesh.pump();

    let stored = mesh
        .node(source)
        .model_exporter(ROWS)
        .unwrap()
        .model()
        .data(&[IndexStep::new(2, 0)], DISPLAY_ROLE);
    assert_eq!(stored, Some(Value::from("two")));
    let replica = mesh.node(client).model_replica(ROWS).unwrap();
    assert_eq!(replica.cached_data(index, DISPLAY_ROLE), Some(&Value::from("two")));
}

#[test]
fn test_every_replica_sees_inserts() {
    let (mut mesh, source, first) = table_mesh(3, NodeConfig::default());
    let second = mesh.add_node("other:1");
    mesh.node(second).acquire_model(ROWS).unwrap();
    mesh.connect(second, source);
    mesh.pump();

    let rows = vec![vec![CellData::from([(DISPLAY_ROLE, Value::Int(100))])]];
    assert!(mesh
        .node(source)
        .model_exporter_mut(ROWS)
        .unwrap()
        .insert_rows(&[], 1, rows));
    mesh.pump();

    for node in [first, second] {
        let replica = mesh.node(node).model_replica_mut(ROWS).unwrap();
        assert_eq!(replica.row_count(replica.root()), Some(4));
        assert!(replica.take_events().iter().any(|event| matches!(
            event,
            ModelEvent::RowsInserted { first: 1, last: 1, .. }
        )));
    }
    display(&mut mesh, second, 1);
    mesh.pump();
    assert_eq!(display(&mut mesh, second, 1), DataState::Available(Value::Int(100)));
    assert_eq!(display(&mut mesh, second, 3), DataState::NotYetAvailable);
    mesh.pump();
    assert_eq!(display(&mut mesh, second, 3), DataState::Available(Value::Int(2)));
}

#[test]
fn test_lost_channel_keeps_cache_and_resyncs() {
    let (mut mesh, source, client) = table_mesh(5, NodeConfig::default());
    display(&mut mesh, client, 0);
    mesh.pump();
    assert_eq!(display(&mut mesh, client, 0), DataState::Available(Value::Int(0)));

    mesh.disconnect(client, source);
    let replica = mesh.node(client).model_replica(ROWS).unwrap();
    assert_eq!(replica.state(), ReplicaState::Suspect);

    // Changed while the replica was away.
    assert!(mesh.node(source).model_exporter_mut(ROWS).unwrap().remove_rows(&[], 0, 2));
    mesh.connect(client, source);
    mesh.pump();

    let replica = mesh.node(client).model_replica_mut(ROWS).unwrap();
    assert_eq!(replica.state(), ReplicaState::Valid);
    assert_eq!(replica.row_count(replica.root()), Some(3));
    assert_eq!(display(&mut mesh, client, 0), DataState::NotYetAvailable);
    mesh.pump();
    assert_eq!(display(&mut mesh, client, 0), DataState::Available(Value::Int(2)));
}

#[test]
fn test_disabled_model_returns_replica_to_uninitialized() {
    let (mut mesh, source, client) = table_mesh(5, NodeConfig::default());
    assert!(mesh.node(source).disable_remoting(ROWS));
    mesh.pump();
    assert_eq!(
        mesh.node(client).replica_state(ROWS),
        Some(ReplicaState::Uninitialized)
    );
}
