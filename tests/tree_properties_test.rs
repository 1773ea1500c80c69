//! Structural properties of the loom tree store.

use std::collections::HashSet;

use generational_arena::Index;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rstest::{fixture, rstest};
use serde_json::json;

use loomtree::domain::{DomainError, LoomTree, Node, NodeId, SearchOptions, TransitionMode};
use loomtree::util::testing;

/// R -> (A -> C, B)
struct Scenario {
    tree: LoomTree,
    r: Index,
    a: Index,
    b: Index,
    c: Index,
}

#[fixture]
fn scenario() -> Scenario {
    testing::init_test_setup();
    let mut tree = LoomTree::new();
    let r = tree.insert_with_id("R".into(), "Once", None).unwrap();
    let a = tree.insert_with_id("A".into(), " upon", Some(r)).unwrap();
    let b = tree.insert_with_id("B".into(), " more", Some(r)).unwrap();
    let c = tree.insert_with_id("C".into(), " a time", Some(a)).unwrap();
    Scenario { tree, r, a, b, c }
}

/// Wider tree: root with three levels and uneven branching.
#[fixture]
fn wide() -> LoomTree {
    let mut tree = LoomTree::new();
    let root = tree.insert_node("root", None).unwrap();
    for i in 0..3 {
        let child = tree.insert_node(format!("c{i}"), Some(root)).unwrap();
        for j in 0..i {
            let grandchild = tree.insert_node(format!("c{i}{j}"), Some(child)).unwrap();
            tree.insert_node(format!("c{i}{j}x"), Some(grandchild)).unwrap();
        }
    }
    tree
}

#[rstest]
fn given_any_node_when_measuring_depth_then_equals_ancestry_length_minus_one(wide: LoomTree) {
    for (idx, _) in wide.iter() {
        assert_eq!(wide.depth(idx).unwrap(), wide.ancestry(idx).unwrap().len() - 1);
    }
}

#[rstest]
fn given_any_pair_when_measuring_distance_then_symmetric_and_zero_on_self(wide: LoomTree) {
    let nodes: Vec<Index> = wide.iter().map(|(idx, _)| idx).collect();
    for &a in &nodes {
        assert_eq!(wide.path_distance(a, a).unwrap(), 0);
        for &b in &nodes {
            let ab = wide.path_distance(a, b).unwrap();
            assert_eq!(ab, wide.path_distance(b, a).unwrap());
            if a != b {
                assert!(ab > 0);
            }
        }
    }
}

#[rstest]
fn given_any_pair_when_finding_common_ancestor_then_deepest_shared_ancestor(wide: LoomTree) {
    let nodes: Vec<Index> = wide.iter().map(|(idx, _)| idx).collect();
    for &a in &nodes {
        for &b in &nodes {
            let (nca, depth) = wide.nearest_common_ancestor(a, b).unwrap();
            assert!(wide.in_ancestry(nca, a).unwrap());
            assert!(wide.in_ancestry(nca, b).unwrap());
            assert_eq!(wide.depth(nca).unwrap(), depth);

            let shared: Vec<Index> = wide
                .ancestry(a)
                .unwrap()
                .into_iter()
                .filter(|&n| wide.in_ancestry(n, b).unwrap())
                .collect();
            let deepest = shared.iter().map(|&n| wide.depth(n).unwrap()).max().unwrap();
            assert_eq!(depth, deepest);
        }
    }
}

#[rstest]
fn given_cousin_and_uncle_when_measuring_distance_then_two(scenario: Scenario) {
    assert_eq!(scenario.tree.path_distance(scenario.c, scenario.b).unwrap(), 2);
    let (nca, depth) = scenario.tree.nearest_common_ancestor(scenario.c, scenario.b).unwrap();
    assert_eq!((nca, depth), (scenario.r, 0));
}

#[rstest]
fn given_prefix_ancestry_when_finding_common_ancestor_then_shorter_endpoint(scenario: Scenario) {
    let (nca, depth) = scenario.tree.nearest_common_ancestor(scenario.a, scenario.c).unwrap();
    assert_eq!((nca, depth), (scenario.a, 1));
}

#[rstest]
fn given_two_children_when_uniform_transition_then_each_about_half(scenario: Scenario) {
    // Arrange
    let mut rng = StdRng::seed_from_u64(7);
    let trials = 4000;

    // Act
    let picked_a = (0..trials)
        .filter(|_| {
            scenario
                .tree
                .stochastic_transition(scenario.r, TransitionMode::Uniform, None, &mut rng)
                .unwrap()
                == scenario.a
        })
        .count();

    // Assert
    let share = picked_a as f64 / trials as f64;
    assert!((0.45..0.55).contains(&share), "share of A was {share}");
}

#[rstest]
fn given_filter_rejecting_all_children_when_transitioning_then_invalid_weights(scenario: Scenario) {
    let reject = |_: &Node| false;
    let result = scenario.tree.stochastic_transition(
        scenario.r,
        TransitionMode::Descendants,
        Some(&reject),
        &mut StdRng::seed_from_u64(1),
    );
    assert!(matches!(result, Err(DomainError::InvalidWeights(_))));
}

#[rstest]
fn given_leaf_when_transitioning_then_precondition_violated(scenario: Scenario) {
    let result = scenario.tree.stochastic_transition(
        scenario.c,
        TransitionMode::Uniform,
        None,
        &mut StdRng::seed_from_u64(1),
    );
    assert!(matches!(result, Err(DomainError::PreconditionViolated(_))));
}

#[rstest]
fn given_descendant_weights_when_computing_then_proportional_to_subtree_size(scenario: Scenario) {
    let weights = scenario
        .tree
        .subtree_weights(scenario.r, TransitionMode::Descendants, None)
        .unwrap();
    assert_eq!(weights, vec![2.0 / 3.0, 1.0 / 3.0]);
}

#[rstest]
fn given_filter_when_taking_subset_then_exactly_nodes_passing_on_whole_path(wide: LoomTree) {
    // Arrange: drop nodes ending in "0"; their descendants go with them
    let filter = |node: &Node| !node.text.ends_with('0');
    let root = wide.root().unwrap();

    // Act
    let view = wide.tree_subset(root, Some(&filter), &[]).unwrap();

    // Assert
    let expected: HashSet<NodeId> = wide
        .iter()
        .filter(|(idx, _)| {
            wide.ancestry(*idx)
                .unwrap()
                .into_iter()
                .skip(1)
                .all(|n| filter(wide.node(n).unwrap()))
        })
        .map(|(_, node)| node.id().clone())
        .collect();
    let actual: HashSet<NodeId> = view.ids().into_iter().collect();
    assert_eq!(actual, expected);
    assert_eq!(view.node_count(), expected.len());
}

#[rstest]
fn given_depth_limit_zero_when_listing_subtree_then_empty(scenario: Scenario) {
    assert!(scenario.tree.subtree_list(scenario.r, None, Some(0)).unwrap().is_empty());
    assert_eq!(scenario.tree.subtree_list(scenario.r, None, None).unwrap().len(), 4);
    assert_eq!(scenario.tree.subtree_list(scenario.r, None, Some(1)).unwrap(), vec![scenario.r]);
}

#[rstest]
fn given_depth_limit_when_building_view_then_only_near_levels(scenario: Scenario) {
    let view = scenario.tree.depth_limited_tree(scenario.r, 1).unwrap();
    let ids: HashSet<NodeId> = view.ids().into_iter().collect();
    assert_eq!(ids, HashSet::from(["R".into(), "A".into(), "B".into()]));

    let bare = scenario.tree.depth_limited_tree(scenario.r, 0).unwrap();
    assert!(bare.children.is_empty());
}

#[rstest]
fn given_focused_path_when_limiting_branching_then_side_branches_cut(scenario: Scenario) {
    let path = scenario.tree.ancestry(scenario.c).unwrap();
    let view = scenario.tree.limited_branching_tree(&path, scenario.r, 0).unwrap();
    let ids: HashSet<NodeId> = view.ids().into_iter().collect();
    assert_eq!(ids, HashSet::from(["R".into(), "A".into(), "C".into()]));
}

#[rstest]
fn given_fresh_attribute_when_overwriting_twice_then_idempotent(mut wide: LoomTree) {
    // Arrange
    let root = wide.root().unwrap();

    // Act
    let first = wide.overwrite_subtree(root, "visited", &json!(true), None, false).unwrap();
    let second = wide.overwrite_subtree(root, "visited", &json!(true), None, false).unwrap();

    // Assert
    assert!(first.is_empty());
    assert!(second.is_empty());
    for (_, node) in wide.iter() {
        assert_eq!(node.attribute("visited"), Some(json!(true)));
    }
}

#[rstest]
fn given_customized_node_when_overwriting_then_flood_stops_there(mut scenario: Scenario) {
    // Arrange
    scenario
        .tree
        .overwrite_subtree(scenario.a, "color", &json!("red"), None, false)
        .unwrap();

    // Act
    let blocked = scenario
        .tree
        .overwrite_subtree(scenario.r, "color", &json!("blue"), None, false)
        .unwrap();

    // Assert
    assert_eq!(blocked, vec![scenario.a]);
    assert_eq!(scenario.tree.node(scenario.c).unwrap().attribute("color"), Some(json!("red")));
    assert_eq!(scenario.tree.node(scenario.b).unwrap().attribute("color"), Some(json!("blue")));
}

#[rstest]
fn given_immutable_node_when_overwriting_text_then_blocked_unless_forced(mut scenario: Scenario) {
    scenario.tree.get_node_mut(scenario.b).unwrap().mutable = false;

    let blocked = scenario
        .tree
        .overwrite_subtree(scenario.b, "text", &json!("x"), None, false)
        .unwrap();
    assert_eq!(blocked, vec![scenario.b]);
    assert_eq!(scenario.tree.node(scenario.b).unwrap().text, " more");

    scenario
        .tree
        .overwrite_subtree(scenario.b, "text", &json!("x"), None, true)
        .unwrap();
    assert_eq!(scenario.tree.node(scenario.b).unwrap().text, "x");
}

#[rstest]
#[case("ONCE", false, false, 1)]
#[case("ONCE", true, false, 0)]
#[case("o", false, false, 3)]
#[case(r"\bti\w+", false, true, 1)]
fn given_pattern_when_searching_then_expected_match_count(
    scenario: Scenario,
    #[case] pattern: &str,
    #[case] case_sensitive: bool,
    #[case] regex: bool,
    #[case] expected: usize,
) {
    let options = SearchOptions {
        case_sensitive,
        regex,
        ..Default::default()
    };
    let matches = scenario.tree.search(scenario.r, pattern, &options).unwrap();
    assert_eq!(matches.len(), expected);
}

#[rstest]
fn given_depth_limit_when_searching_then_deeper_nodes_ignored(scenario: Scenario) {
    let options = SearchOptions {
        max_depth: Some(2),
        ..Default::default()
    };
    let matches = scenario.tree.search(scenario.r, "time", &options).unwrap();
    assert!(matches.is_empty());

    let zero = SearchOptions {
        max_depth: Some(0),
        ..Default::default()
    };
    assert!(scenario.tree.search(scenario.r, "Once", &zero).unwrap().is_empty());
}

#[rstest]
fn given_allow_set_when_searching_then_descends_past_excluded_nodes(scenario: Scenario) {
    let options = SearchOptions {
        allow: Some(HashSet::from([NodeId::from("C")])),
        ..Default::default()
    };
    let matches = scenario.tree.search(scenario.r, " ", &options).unwrap();
    assert!(!matches.is_empty());
    assert!(matches.iter().all(|m| m.node_id == NodeId::from("C")));
}

#[rstest]
fn given_missing_timestamp_when_ordering_then_missing_timestamp_error(scenario: Scenario) {
    let result = scenario.tree.created_before(scenario.a, scenario.b);
    assert!(matches!(result, Err(DomainError::MissingTimestamp(_))));
}

#[rstest]
fn given_current_on_path_when_collapsing_then_only_path_and_levels_below_current(
    scenario: Scenario,
) {
    // Arrange
    let path = scenario.tree.ancestry(scenario.c).unwrap();

    // Act
    let at_a = scenario
        .tree
        .collapsed_wavefunction(&path, scenario.r, scenario.a, 1)
        .unwrap();
    let at_a_flat = scenario
        .tree
        .collapsed_wavefunction(&path, scenario.r, scenario.a, 0)
        .unwrap();

    // Assert: B branches off the path above the current node and is cut
    let ids: HashSet<NodeId> = at_a.ids().into_iter().collect();
    assert_eq!(ids, HashSet::from(["R".into(), "A".into(), "C".into()]));
    assert_eq!(at_a_flat.ids(), vec![NodeId::from("R"), NodeId::from("A")]);
}

#[rstest]
fn given_current_at_root_when_collapsing_then_side_branches_below_it_kept(scenario: Scenario) {
    let path = scenario.tree.ancestry(scenario.c).unwrap();

    let view = scenario
        .tree
        .collapsed_wavefunction(&path, scenario.r, scenario.r, 1)
        .unwrap();

    let ids: HashSet<NodeId> = view.ids().into_iter().collect();
    assert_eq!(ids, HashSet::from(["R".into(), "A".into(), "B".into()]));
}

#[rstest]
#[case(1, "A", &["A", "C"])]
#[case(2, "R", &["R", "A", "C"])]
#[case(3, "R", &["R", "A", "C", "B"])]
fn given_distance_limit_when_building_view_then_only_nearby_nodes(
    scenario: Scenario,
    #[case] limit: usize,
    #[case] expected_root: &str,
    #[case] expected: &[&str],
) {
    let view = scenario
        .tree
        .limited_distance_tree(scenario.r, scenario.c, limit)
        .unwrap();

    assert_eq!(view.id, NodeId::from(expected_root));
    let ids: HashSet<NodeId> = view.ids().into_iter().collect();
    let expected: HashSet<NodeId> = expected.iter().map(|&id| NodeId::from(id)).collect();
    assert_eq!(ids, expected);
}

#[rstest]
fn given_filter_when_indexing_then_each_node_maps_to_its_pruned_subtree(scenario: Scenario) {
    // Arrange
    let filter = |node: &Node| node.text != " more";

    // Act
    let index = scenario.tree.conditional_index(scenario.r, Some(&filter)).unwrap();

    // Assert
    let keys: HashSet<NodeId> = index.keys().cloned().collect();
    assert_eq!(keys, HashSet::from(["R".into(), "A".into(), "C".into()]));
    assert_eq!(index[&NodeId::from("A")].ids(), vec![NodeId::from("A"), NodeId::from("C")]);
    assert!(index[&NodeId::from("C")].children.is_empty());
    assert_eq!(index[&NodeId::from("R")].node_count(), 3);
}

#[rstest]
fn given_attribute_on_ancestor_when_inheriting_then_nearest_value_wins(mut scenario: Scenario) {
    // Arrange
    let tree = &mut scenario.tree;
    tree.get_node_mut(scenario.r).unwrap().attributes.insert("model".into(), json!("ada"));
    tree.get_node_mut(scenario.a).unwrap().attributes.insert("model".into(), json!("davinci"));

    // Act & Assert
    assert_eq!(tree.inherited_attribute("model", scenario.c).unwrap(), Some(json!("davinci")));
    assert_eq!(tree.inherited_attribute("model", scenario.b).unwrap(), Some(json!("ada")));
    assert_eq!(tree.inherited_attribute("missing", scenario.c).unwrap(), None);

    tree.get_node_mut(scenario.c).unwrap().attributes.insert("model".into(), json!("own"));
    assert_eq!(tree.inherited_attribute("model", scenario.c).unwrap(), Some(json!("own")));
}

#[rstest]
fn given_range_when_taking_ancestry_then_both_ends_included(scenario: Scenario) {
    let tree = &scenario.tree;

    assert_eq!(
        tree.ancestry_in_range(scenario.a, scenario.c).unwrap(),
        vec![scenario.a, scenario.c]
    );
    assert_eq!(
        tree.ancestry_in_range(scenario.r, scenario.c).unwrap(),
        vec![scenario.r, scenario.a, scenario.c]
    );
    assert_eq!(tree.ancestry_in_range(scenario.c, scenario.c).unwrap(), vec![scenario.c]);
}

#[rstest]
fn given_range_root_off_path_when_taking_ancestry_then_not_found(scenario: Scenario) {
    let result = scenario.tree.ancestry_in_range(scenario.b, scenario.c);
    assert!(matches!(result, Err(DomainError::NotFound(_))));
}

#[rstest]
fn given_tree_when_collecting_leaves_then_childless_nodes_only(scenario: Scenario) {
    let leaves: HashSet<Index> = scenario.tree.leaf_nodes().into_iter().collect();
    assert_eq!(leaves, HashSet::from([scenario.c, scenario.b]));

    let mut single = LoomTree::new();
    let root = single.insert_node("only", None).unwrap();
    assert_eq!(single.leaf_nodes(), vec![root]);
}
