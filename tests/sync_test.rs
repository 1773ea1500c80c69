//! Sync client over a recording transport: upserts, push and pull.

use std::sync::Arc;

use serde_json::json;

use loomtree::application::{ApplicationError, SyncClient};
use loomtree::domain::{LoomTree, NestedNode, NodeId};
use loomtree::infrastructure::traits::HttpMethod;
use loomtree::util::testing::{self, RecordingTransport};

fn client(transport: &Arc<RecordingTransport>) -> SyncClient {
    testing::init_test_setup();
    SyncClient::new(transport.clone(), "tree-7", "s3cret").with_author("alice")
}

#[test]
fn given_new_tree_when_pushing_then_all_nodes_posted_in_one_batch() {
    // Arrange
    let transport = Arc::new(RecordingTransport::new().respond(
        HttpMethod::Post,
        "/nodes/exists",
        200,
        json!({}),
    ));
    let tree = LoomTree::from_nested(
        NestedNode::new("Once")
            .with_children(vec![NestedNode::new(" upon"), NestedNode::new(" more")]),
    )
    .unwrap();

    // Act
    let (created, updated) = client(&transport).push_tree(&tree).unwrap();

    // Assert
    assert_eq!((created, updated), (3, 0));
    let requests = transport.requests();
    let batch = requests
        .iter()
        .find(|r| r.method == HttpMethod::Post && r.path == "/nodes/batch")
        .unwrap();
    let nodes = batch.body.as_ref().unwrap().as_array().unwrap();
    assert_eq!(nodes.len(), 3);
    assert!(nodes.iter().all(|n| n["author"] == json!("alice")));
    assert_eq!(nodes.iter().filter(|n| n["parentId"].is_null()).count(), 1);
}

#[test]
fn given_remote_nodes_when_pulling_then_validated_tree() {
    let transport = Arc::new(RecordingTransport::new().respond(
        HttpMethod::Get,
        "/nodes",
        200,
        json!([
            {
                "id": "r",
                "parentId": null,
                "text": "Once",
                "children": ["a"],
                "timestamp": "2024-05-01 10:00:00"
            },
            {"id": "a", "parentId": "r", "text": " upon", "children": []}
        ]),
    ));

    let tree = client(&transport).pull_tree().unwrap();

    assert_eq!(tree.len(), 2);
    let root = tree.node(tree.lookup(&NodeId::from("r")).unwrap()).unwrap();
    assert_eq!(root.meta.creation_timestamp.as_deref(), Some("2024-05-01-10.00.00"));
}

#[test]
fn given_inconsistent_remote_nodes_when_pulling_then_domain_error() {
    let transport = Arc::new(RecordingTransport::new().respond(
        HttpMethod::Get,
        "/nodes",
        200,
        json!([
            {"id": "r", "text": "Once"},
            {"id": "a", "parentId": "missing", "text": " upon"}
        ]),
    ));

    let result = client(&transport).pull_tree();

    assert!(matches!(result, Err(ApplicationError::Domain(_))));
}

#[test]
fn given_since_timestamp_when_listing_then_filtered_routes() {
    let transport = Arc::new(
        RecordingTransport::new()
            .respond(HttpMethod::Get, "/nodes/get/2024-01-01", 200, json!([]))
            .respond(HttpMethod::Get, "/history/2024-01-01", 200, json!([{"op": "add"}])),
    );
    let client = client(&transport);

    assert!(client.get_nodes(Some("2024-01-01")).unwrap().is_empty());
    assert_eq!(client.history(Some("2024-01-01")).unwrap(), json!([{"op": "add"}]));
}

#[test]
fn given_exists_answers_when_checking_then_both_shapes_accepted() {
    let transport = Arc::new(
        RecordingTransport::new()
            .respond(HttpMethod::Get, "/nodes/exists/a", 200, json!({"exists": true}))
            .respond(HttpMethod::Post, "/nodes/exists", 200, json!([true, false])),
    );
    let client = client(&transport);

    assert!(client.exists(&"a".into()).unwrap());
    let batch = client.exists_batch(&["a".into(), "b".into()]).unwrap();
    assert_eq!(batch.get(&NodeId::from("a")), Some(&true));
    assert_eq!(batch.get(&NodeId::from("b")), Some(&false));
}

#[test]
fn given_unauthorized_when_fetching_root_then_sync_error() {
    let transport = Arc::new(RecordingTransport::new().respond(
        HttpMethod::Get,
        "/nodes/root",
        401,
        json!("denied"),
    ));
    let result = client(&transport).root();
    assert!(matches!(result, Err(ApplicationError::Sync { status: 401, .. })));
}
