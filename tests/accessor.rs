//! Accessor CRUD, validation, index admin and durability-stream tests.

use std::collections::HashMap;
use std::sync::Arc;

use tessera::{
    Config, EdgeTypeId, Gid, Hlc, LabelId, MemoryWal, PrimaryKey, PropertyId, PropertyValue,
    SchemaProperty, SchemaType, Shard, ShardError, VertexId, View,
};

const PRIMARY_LABEL: LabelId = LabelId::new(1);
const PRIMARY_PROPERTY: PropertyId = PropertyId::new(2);
const EDGE_TYPE: EdgeTypeId = EdgeTypeId::new(3);
const SECONDARY_LABEL: LabelId = LabelId::new(4);
const SECONDARY_PROPERTY: PropertyId = PropertyId::new(5);

fn pk(v: i64) -> PrimaryKey {
    PrimaryKey(vec![PropertyValue::Int(v)])
}

fn vid(v: i64) -> VertexId {
    VertexId::new(PRIMARY_LABEL, pk(v))
}

fn new_shard() -> Shard {
    Shard::new(
        PRIMARY_LABEL,
        pk(0),
        None,
        vec![SchemaProperty {
            property: PRIMARY_PROPERTY,
            kind: SchemaType::Int,
        }],
        Hlc::from_logical(0),
        Config::default(),
        HashMap::from([
            (1, "label".to_string()),
            (2, "property".to_string()),
            (3, "edge_type".to_string()),
            (4, "secondary_label".to_string()),
            (5, "secondary_property".to_string()),
        ]),
    )
    .unwrap()
}

struct Coordinator {
    last: u64,
}

impl Coordinator {
    fn new() -> Self {
        Self { last: 1000 }
    }

    fn next(&mut self) -> Hlc {
        self.last += 1000;
        Hlc::from_logical(self.last)
    }
}

#[test]
fn test_create_and_find_vertex() {
    let shard = new_shard();
    let mut coordinator = Coordinator::new();

    let acc = shard.access(None);
    let id = acc
        .create_vertex(
            &[SECONDARY_LABEL],
            vec![PropertyValue::Int(1)],
            vec![(SECONDARY_PROPERTY, PropertyValue::Int(121))],
        )
        .unwrap();
    assert_eq!(id, vid(1));
    acc.commit(coordinator.next()).unwrap();

    let acc = shard.access(None);
    let found = acc.find_vertex(&pk(1), View::Old).unwrap();
    assert!(found.has_label(SECONDARY_LABEL));
    assert_eq!(
        found.properties.get(&SECONDARY_PROPERTY),
        Some(&PropertyValue::Int(121))
    );
}

#[test]
fn test_create_vertex_validates_schema() {
    let shard = new_shard();
    let acc = shard.access(None);

    let err = acc
        .create_vertex(&[], vec![PropertyValue::String("x".into())], vec![])
        .unwrap_err();
    assert!(matches!(err, ShardError::SchemaViolation(_)));

    let err = acc.create_vertex(&[], vec![], vec![]).unwrap_err();
    assert!(matches!(err, ShardError::SchemaViolation(_)));

    // The primary label is implicit.
    let err = acc
        .create_vertex(&[PRIMARY_LABEL], vec![PropertyValue::Int(1)], vec![])
        .unwrap_err();
    assert!(matches!(err, ShardError::SchemaViolation(_)));

    // Primary-key properties cannot be set as ordinary properties.
    let err = acc
        .create_vertex(
            &[],
            vec![PropertyValue::Int(1)],
            vec![(PRIMARY_PROPERTY, PropertyValue::Int(9))],
        )
        .unwrap_err();
    assert!(matches!(err, ShardError::SchemaViolation(_)));
}

#[test]
fn test_create_vertex_rejects_duplicate_key() {
    let shard = new_shard();
    let mut coordinator = Coordinator::new();

    let acc = shard.access(None);
    acc.create_vertex(&[], vec![PropertyValue::Int(1)], vec![])
        .unwrap();
    acc.commit(coordinator.next()).unwrap();

    let acc = shard.access(None);
    let err = acc
        .create_vertex(&[], vec![PropertyValue::Int(1)], vec![])
        .unwrap_err();
    assert_eq!(err, ShardError::VertexAlreadyInserted);
}

#[test]
fn test_out_of_range_key_is_a_routing_error() {
    let shard = Shard::new(
        PRIMARY_LABEL,
        pk(0),
        Some(pk(100)),
        vec![SchemaProperty {
            property: PRIMARY_PROPERTY,
            kind: SchemaType::Int,
        }],
        Hlc::from_logical(0),
        Config::default(),
        HashMap::new(),
    )
    .unwrap();

    let acc = shard.access(None);
    let err = acc
        .create_vertex(&[], vec![PropertyValue::Int(100)], vec![])
        .unwrap_err();
    assert_eq!(err, ShardError::OutOfRange);
    let err = acc.find_vertex(&pk(-1), View::Old).unwrap_err();
    assert_eq!(err, ShardError::OutOfRange);
    assert!(shard.is_vertex_belong_to_shard(&vid(99)));
    assert!(!shard.is_vertex_belong_to_shard(&vid(100)));
}

#[test]
fn test_plain_delete_blocked_by_edges() {
    let shard = new_shard();
    let mut coordinator = Coordinator::new();

    let acc = shard.access(None);
    acc.create_vertex(&[], vec![PropertyValue::Int(1)], vec![])
        .unwrap();
    acc.create_vertex(&[], vec![PropertyValue::Int(2)], vec![])
        .unwrap();
    acc.create_edge(vid(1), vid(2), EDGE_TYPE, Gid::new(0))
        .unwrap();
    acc.commit(coordinator.next()).unwrap();

    let acc = shard.access(None);
    assert_eq!(
        acc.delete_vertex(&pk(1)).unwrap_err(),
        ShardError::VertexHasEdges
    );

    let (vertex, edges) = acc.detach_delete_vertex(&pk(1)).unwrap().unwrap();
    assert_eq!(vertex.id, vid(1));
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].gid, Gid::new(0));
    acc.commit(coordinator.next()).unwrap();

    let acc = shard.access(None);
    assert_eq!(
        acc.find_vertex(&pk(1), View::Old).unwrap_err(),
        ShardError::NonexistentObject
    );
    // The far endpoint lost its link as well.
    let two = acc.find_vertex(&pk(2), View::Old).unwrap();
    assert!(two.in_edges.is_empty());
}

#[test]
fn test_edge_properties_respect_config() {
    let mut config = Config::default();
    config.items.properties_on_edges = false;
    let shard = Shard::new(
        PRIMARY_LABEL,
        pk(0),
        None,
        vec![SchemaProperty {
            property: PRIMARY_PROPERTY,
            kind: SchemaType::Int,
        }],
        Hlc::from_logical(0),
        config,
        HashMap::new(),
    )
    .unwrap();
    let mut coordinator = Coordinator::new();

    let acc = shard.access(None);
    acc.create_vertex(&[], vec![PropertyValue::Int(1)], vec![])
        .unwrap();
    acc.create_vertex(&[], vec![PropertyValue::Int(2)], vec![])
        .unwrap();
    acc.create_edge(vid(1), vid(2), EDGE_TYPE, Gid::new(0))
        .unwrap();
    acc.commit(coordinator.next()).unwrap();

    let acc = shard.access(None);
    assert_eq!(
        acc.set_edge_property(Gid::new(0), SECONDARY_PROPERTY, PropertyValue::Int(1))
            .unwrap_err(),
        ShardError::PropertiesDisabled
    );
}

#[test]
fn test_edge_property_round_trip() {
    let shard = new_shard();
    let mut coordinator = Coordinator::new();

    let acc = shard.access(None);
    acc.create_vertex(&[], vec![PropertyValue::Int(1)], vec![])
        .unwrap();
    acc.create_vertex(&[], vec![PropertyValue::Int(2)], vec![])
        .unwrap();
    acc.create_edge(vid(1), vid(2), EDGE_TYPE, Gid::new(0))
        .unwrap();
    acc.set_edge_property(Gid::new(0), SECONDARY_PROPERTY, PropertyValue::Double(2.5))
        .unwrap();
    acc.commit(coordinator.next()).unwrap();

    let acc = shard.access(None);
    let edge = acc.find_edge(Gid::new(0), View::Old).unwrap();
    assert_eq!(
        edge.properties.get(&SECONDARY_PROPERTY),
        Some(&PropertyValue::Double(2.5))
    );
}

#[test]
fn test_cross_shard_edge_endpoint_by_reference() {
    let shard = Shard::new(
        PRIMARY_LABEL,
        pk(0),
        Some(pk(100)),
        vec![SchemaProperty {
            property: PRIMARY_PROPERTY,
            kind: SchemaType::Int,
        }],
        Hlc::from_logical(0),
        Config::default(),
        HashMap::new(),
    )
    .unwrap();
    let mut coordinator = Coordinator::new();

    let acc = shard.access(None);
    acc.create_vertex(&[], vec![PropertyValue::Int(1)], vec![])
        .unwrap();
    // The far endpoint lives on another shard; it is referenced by id only.
    acc.create_edge(vid(1), vid(500), EDGE_TYPE, Gid::new(7))
        .unwrap();
    acc.commit(coordinator.next()).unwrap();

    let acc = shard.access(None);
    let one = acc.find_vertex(&pk(1), View::Old).unwrap();
    assert_eq!(one.out_edges.len(), 1);
    assert_eq!(one.out_edges[0].vertex, vid(500));
    assert!(acc.find_edge(Gid::new(7), View::Old).is_ok());

    // Both endpoints remote is a routing error.
    let err = acc
        .create_edge(vid(400), vid(500), EDGE_TYPE, Gid::new(8))
        .unwrap_err();
    assert_eq!(err, ShardError::OutOfRange);
}

#[test]
fn test_label_index_and_counts() {
    let shard = new_shard();
    let mut coordinator = Coordinator::new();

    assert!(shard.create_index(SECONDARY_LABEL));
    assert!(!shard.create_index(SECONDARY_LABEL));

    let acc = shard.access(None);
    for i in 0..4 {
        let labels: &[LabelId] = if i % 2 == 0 { &[SECONDARY_LABEL] } else { &[] };
        acc.create_vertex(labels, vec![PropertyValue::Int(i)], vec![])
            .unwrap();
    }
    acc.commit(coordinator.next()).unwrap();

    let acc = shard.access(None);
    let all: Vec<_> = acc.vertices(View::Old).collect();
    assert_eq!(all.len(), 4);
    let by_label: Vec<_> = acc.vertices_by_label(SECONDARY_LABEL, View::Old).collect();
    assert_eq!(by_label.len(), 2);
    assert_eq!(acc.approximate_vertex_count(), 4);
    assert_eq!(acc.approximate_vertex_count_by_label(SECONDARY_LABEL), 2);

    let info = shard.list_all_indices();
    assert_eq!(info.label, vec![SECONDARY_LABEL]);
}

#[test]
fn test_label_property_index() {
    let shard = new_shard();
    let mut coordinator = Coordinator::new();

    assert!(shard.create_label_property_index(SECONDARY_LABEL, SECONDARY_PROPERTY));

    let acc = shard.access(None);
    for i in 0..4 {
        acc.create_vertex(
            &[SECONDARY_LABEL],
            vec![PropertyValue::Int(i)],
            vec![(SECONDARY_PROPERTY, PropertyValue::Int(i % 2))],
        )
        .unwrap();
    }
    acc.commit(coordinator.next()).unwrap();

    let acc = shard.access(None);
    let zeros: Vec<_> = acc
        .vertices_by_label_property(
            SECONDARY_LABEL,
            SECONDARY_PROPERTY,
            Some(PropertyValue::Int(0)),
            View::Old,
        )
        .collect();
    assert_eq!(zeros.len(), 2);
    assert_eq!(
        acc.approximate_vertex_count_by_label_property(SECONDARY_LABEL, SECONDARY_PROPERTY),
        4
    );
    assert_eq!(
        acc.approximate_vertex_count_by_label_property_value(
            SECONDARY_LABEL,
            SECONDARY_PROPERTY,
            &PropertyValue::Int(1)
        ),
        2
    );
}

#[test]
fn test_drop_index_is_idempotent() {
    let shard = new_shard();
    assert!(shard.create_index(SECONDARY_LABEL));
    assert!(shard.drop_index(SECONDARY_LABEL));
    assert!(!shard.drop_index(SECONDARY_LABEL));
    assert!(!shard.drop_label_property_index(SECONDARY_LABEL, SECONDARY_PROPERTY));
}

#[test]
fn test_schema_admin_surface() {
    let shard = new_shard();
    let other = LabelId::new(9);
    let schema = vec![SchemaProperty {
        property: PropertyId::new(10),
        kind: SchemaType::String,
    }];
    assert!(shard.create_schema(other, schema.clone()));
    assert!(!shard.create_schema(other, schema));
    assert_eq!(shard.list_all_schemas().len(), 2);
    assert!(shard.drop_schema(other));
    assert!(!shard.drop_schema(other));
}

#[test]
fn test_name_mapping() {
    let shard = new_shard();
    assert_eq!(shard.name_to_label("label"), Some(PRIMARY_LABEL));
    assert_eq!(shard.label_to_name(SECONDARY_LABEL).as_deref(), Some("secondary_label"));
    assert_eq!(shard.name_to_property("property"), Some(PRIMARY_PROPERTY));
    assert_eq!(shard.name_to_edge_type("edge_type"), Some(EDGE_TYPE));
    assert_eq!(shard.name_to_label("missing"), None);
}

#[test]
fn test_storage_info_and_split_suggestion() {
    let mut config = Config::default();
    config.split_vertex_threshold = 4;
    let shard = Shard::new(
        PRIMARY_LABEL,
        pk(0),
        None,
        vec![SchemaProperty {
            property: PRIMARY_PROPERTY,
            kind: SchemaType::Int,
        }],
        Hlc::from_logical(0),
        config,
        HashMap::new(),
    )
    .unwrap();
    let mut coordinator = Coordinator::new();

    assert!(shard.should_split().is_none());
    let acc = shard.access(None);
    for i in 0..6 {
        acc.create_vertex(&[], vec![PropertyValue::Int(i)], vec![])
            .unwrap();
    }
    acc.create_edge(vid(0), vid(1), EDGE_TYPE, Gid::new(0))
        .unwrap();
    acc.commit(coordinator.next()).unwrap();

    let info = shard.info();
    assert_eq!(info.vertex_count, 6);
    assert_eq!(info.edge_count, 1);
    assert!(info.average_degree > 0.0);

    let suggestion = shard.should_split().unwrap();
    assert_eq!(suggestion.split_key, pk(3));
    assert_eq!(suggestion.low_key, pk(0));
}

#[test]
fn test_wal_stream_and_replay() {
    let shard = new_shard();
    let wal = Arc::new(MemoryWal::new());
    shard.attach_wal(wal.clone());
    let mut coordinator = Coordinator::new();

    let acc = shard.access(None);
    acc.create_vertex(
        &[SECONDARY_LABEL],
        vec![PropertyValue::Int(1)],
        vec![(SECONDARY_PROPERTY, PropertyValue::Int(7))],
    )
    .unwrap();
    acc.create_vertex(&[], vec![PropertyValue::Int(2)], vec![])
        .unwrap();
    acc.create_edge(vid(1), vid(2), EDGE_TYPE, Gid::new(0))
        .unwrap();
    acc.commit(coordinator.next()).unwrap();

    let acc = shard.access(None);
    acc.set_property(&pk(2), SECONDARY_PROPERTY, PropertyValue::String("v".into()))
        .unwrap();
    acc.commit(coordinator.next()).unwrap();

    // An aborted transaction leaves no trace in the stream.
    let acc = shard.access(None);
    acc.create_vertex(&[], vec![PropertyValue::Int(3)], vec![])
        .unwrap();
    acc.abort();

    let records = wal.records();
    assert!(!records.is_empty());

    let recovered = new_shard();
    tessera::db::wal::replay_into(&recovered, records).unwrap();

    let acc = recovered.access(None);
    let one = acc.find_vertex(&pk(1), View::Old).unwrap();
    assert!(one.has_label(SECONDARY_LABEL));
    assert_eq!(
        one.properties.get(&SECONDARY_PROPERTY),
        Some(&PropertyValue::Int(7))
    );
    let two = acc.find_vertex(&pk(2), View::Old).unwrap();
    assert_eq!(
        two.properties.get(&SECONDARY_PROPERTY),
        Some(&PropertyValue::String("v".into()))
    );
    assert!(acc.find_edge(Gid::new(0), View::Old).is_ok());
    assert_eq!(
        acc.find_vertex(&pk(3), View::Old).unwrap_err(),
        ShardError::NonexistentObject
    );
}

#[test]
fn test_set_property_returns_previous_value() {
    let shard = new_shard();
    let mut coordinator = Coordinator::new();

    let acc = shard.access(None);
    acc.create_vertex(&[], vec![PropertyValue::Int(1)], vec![])
        .unwrap();
    assert_eq!(
        acc.set_property(&pk(1), SECONDARY_PROPERTY, PropertyValue::Int(1))
            .unwrap(),
        None
    );
    assert_eq!(
        acc.set_property(&pk(1), SECONDARY_PROPERTY, PropertyValue::Int(2))
            .unwrap(),
        Some(PropertyValue::Int(1))
    );
    // Null erases.
    assert_eq!(
        acc.set_property(&pk(1), SECONDARY_PROPERTY, PropertyValue::Null)
            .unwrap(),
        Some(PropertyValue::Int(2))
    );
    acc.commit(coordinator.next()).unwrap();

    let acc = shard.access(None);
    let one = acc.find_vertex(&pk(1), View::Old).unwrap();
    assert!(one.properties.is_empty());
}
