//! Property-based tests using proptest.

use proptest::prelude::*;
use remote_objects::model::DISPLAY_ROLE;
use remote_objects::packet::{decode_body, encode_body, Packet};
use remote_objects::types::IndexStep;
use remote_objects::{
    ApiDescriptor, DataState, ItemModel, NodeConfig, PropertyModifier, RegistryHost,
    SourceLocation, TreeModel, Value,
};
use std::collections::BTreeMap;
use test_utils::Mesh;

fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<u64>().prop_map(Value::UInt),
        (-1.0e12f64..1.0e12).prop_map(Value::Double),
        ".{0,16}".prop_map(Value::String),
        proptest::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
    ];
    leaf.prop_recursive(3, 24, 6, |inner| {
        proptest::collection::vec(inner, 0..6).prop_map(Value::List)
    })
}

const MODIFIERS: [PropertyModifier; 3] = [
    PropertyModifier::ReadWrite,
    PropertyModifier::ReadOnly,
    PropertyModifier::Constant,
];

fn build(type_name: &str, properties: &[(String, usize)]) -> std::sync::Arc<ApiDescriptor> {
    properties
        .iter()
        .fold(ApiDescriptor::builder(type_name), |builder, (name, modifier)| {
            builder.property(name, "int", MODIFIERS[*modifier], 0i64)
        })
        .build()
}

#[derive(Debug, Clone)]
enum RegistryOp {
    Add(usize, usize),
    Remove(usize, usize),
}

fn registry_op() -> impl Strategy<Value = RegistryOp> {
    prop_oneof![
        (0usize..3, 0usize..2).prop_map(|(n, e)| RegistryOp::Add(n, e)),
        (0usize..3, 0usize..2).prop_map(|(n, e)| RegistryOp::Remove(n, e)),
    ]
}

#[derive(Debug, Clone)]
enum ModelOp {
    Insert(u32, i64),
    Remove(u32, u32),
    Set(u32, i64),
    Read(u32),
    Pump,
}

fn model_op() -> impl Strategy<Value = ModelOp> {
    prop_oneof![
        (any::<u32>(), 1000i64..2000).prop_map(|(p, v)| ModelOp::Insert(p, v)),
        (any::<u32>(), 1u32..4).prop_map(|(p, c)| ModelOp::Remove(p, c)),
        (any::<u32>(), 5000i64..6000).prop_map(|(p, v)| ModelOp::Set(p, v)),
        any::<u32>().prop_map(ModelOp::Read),
        Just(ModelOp::Pump),
    ]
}

const NAMES: [&str; 3] = ["a", "b", "c"];
const ENDPOINTS: [&str; 2] = ["x:1", "y:1"];
const ROWS: &str = "rows";

proptest! {
    /// Values survive the wire codec unchanged.
    #[test]
    fn value_survives_codec(value in value_strategy()) {
        let packet = Packet::PropertyChanged {
            name: "obj".to_string(),
            index: 3,
            value: value.clone(),
        };
        let decoded = decode_body(&encode_body(&packet).unwrap()).unwrap();
        prop_assert_eq!(decoded, packet);
    }

    /// Identical structures agree; renaming one member disagrees.
    #[test]
    fn signature_tracks_structure(
        names in proptest::collection::btree_set("[a-z]{1,8}", 1..6),
        modifiers in proptest::collection::vec(0usize..3, 6),
        renamed in 0usize..6,
    ) {
        let properties: Vec<(String, usize)> = names
            .iter()
            .zip(&modifiers)
            .map(|(name, modifier)| (name.clone(), *modifier))
            .collect();
        let a = build("Obj", &properties);
        let b = build("Obj", &properties);
        prop_assert_eq!(a.signature(), b.signature());

        let mut changed = properties.clone();
        let slot = renamed % changed.len();
        changed[slot].0.push('_');
        let changed_model = build("Obj", &changed);
        let other_model = build("Other", &properties);
        prop_assert_ne!(a.signature(), changed_model.signature());
        prop_assert_ne!(a.signature(), other_model.signature());
    }

    /// The host behaves like a first-come map of name to endpoint.
    #[test]
    fn registry_matches_first_come_map(ops in proptest::collection::vec(registry_op(), 0..40)) {
        let mut host = RegistryHost::new();
        let mut expected: BTreeMap<String, String> = BTreeMap::new();
        for op in ops {
            match op {
                RegistryOp::Add(n, e) => {
                    let location = SourceLocation::new(NAMES[n], ENDPOINTS[e]);
                    let result = host.add_source(location, None);
                    match expected.get(NAMES[n]) {
                        None => {
                            prop_assert!(matches!(result, Ok(true)));
                            expected.insert(NAMES[n].to_string(), ENDPOINTS[e].to_string());
                        }
                        Some(endpoint) if endpoint == ENDPOINTS[e] => {
                            prop_assert!(matches!(result, Ok(false)));
                        }
                        Some(_) => prop_assert!(result.is_err()),
                    }
                }
                RegistryOp::Remove(n, e) => {
                    let removed = host.remove_source(&SourceLocation::new(NAMES[n], ENDPOINTS[e]));
                    let owned = expected.get(NAMES[n]).is_some_and(|endpoint| endpoint == ENDPOINTS[e]);
                    prop_assert_eq!(removed, owned);
                    if owned {
                        expected.remove(NAMES[n]);
                    }
                }
            }
        }
        let actual: BTreeMap<String, String> = host
            .source_locations()
            .iter()
            .map(|(name, location)| (name.clone(), location.endpoint.clone()))
            .collect();
        prop_assert_eq!(actual, expected);
    }

    /// Once traffic settles, every row the replica resolves matches the source.
    #[test]
    fn model_replica_converges(ops in proptest::collection::vec(model_op(), 0..40)) {
        let mut mesh = Mesh::new();
        let source = mesh.add_node("src:1");
        let client = mesh.add_node_with("cli:1", NodeConfig::default());
        let model = TreeModel::table(8, 1, |row, _| Value::Int(row as i64));
        mesh.node(source).enable_model_remoting(ROWS, Box::new(model)).unwrap();
        mesh.node(client).acquire_model(ROWS).unwrap();
        mesh.connect(client, source);
        mesh.pump();

        for op in ops {
            let source_rows = mesh.node(source).model_exporter(ROWS).unwrap().model().row_count(&[]);
            match op {
                ModelOp::Insert(at, value) => {
                    let rows = vec![vec![[(DISPLAY_ROLE, Value::Int(value))].into()]];
                    let exporter = mesh.node(source).model_exporter_mut(ROWS).unwrap();
                    prop_assert!(exporter.insert_rows(&[], at % (source_rows + 1), rows));
                }
                ModelOp::Remove(at, count) if source_rows > 0 => {
                    let first = at % source_rows;
                    let count = count.min(source_rows - first);
                    let exporter = mesh.node(source).model_exporter_mut(ROWS).unwrap();
                    prop_assert!(exporter.remove_rows(&[], first, count));
                }
                ModelOp::Set(at, value) if source_rows > 0 => {
                    let exporter = mesh.node(source).model_exporter_mut(ROWS).unwrap();
                    exporter.set_data(&[IndexStep::new(at % source_rows, 0)], DISPLAY_ROLE, Value::Int(value));
                }
                ModelOp::Read(at) => {
                    let replica = mesh.node(client).model_replica_mut(ROWS).unwrap();
                    let root = replica.root();
                    if let Some(rows) = replica.row_count(root).filter(|rows| *rows > 0) {
                        let index = replica.index(root, at % rows, 0).unwrap();
                        replica.data(index, DISPLAY_ROLE).unwrap();
                    }
                }
                ModelOp::Pump => mesh.pump(),
                _ => {}
            }
        }
        mesh.pump();

        let source_rows = mesh.node(source).model_exporter(ROWS).unwrap().model().row_count(&[]);
        let replica = mesh.node(client).model_replica_mut(ROWS).unwrap();
        let root = replica.root();
        prop_assert_eq!(replica.row_count(root), Some(source_rows));
        let indices: Vec<_> = (0..source_rows)
            .map(|row| replica.index(root, row, 0).unwrap())
            .collect();
        for index in &indices {
            replica.data(*index, DISPLAY_ROLE).unwrap();
        }
        mesh.pump();

        for (row, index) in indices.into_iter().enumerate() {
            let expected = mesh
                .node(source)
                .model_exporter(ROWS)
                .unwrap()
                .model()
                .data(&[IndexStep::new(row as u32, 0)], DISPLAY_ROLE)
                .unwrap();
            let replica = mesh.node(client).model_replica_mut(ROWS).unwrap();
            prop_assert_eq!(replica.data(index, DISPLAY_ROLE).unwrap(), DataState::Available(expected));
        }
    }
}
