use cgmath::{Matrix4, SquareMatrix, Vector3};
use scene_ngin::{
    data_structures::{
        scene_graph::{NodeKind, NodeTemplate, SceneGraph, SceneTreeCache},
        transform::Transform,
    },
    error::StructuralError,
};

mod common;

fn translation(x: f32, y: f32, z: f32) -> Matrix4<f32> {
    Matrix4::from_translation(Vector3::new(x, y, z))
}

#[test]
fn should_compose_world_transforms_along_the_parent_chain() {
    let mut graph = SceneGraph::new();
    let root = graph.add_group("root");
    let parent = graph.add_group("parent");
    let child = graph.add_group("child");
    graph.append(root, parent).unwrap();
    graph.append(parent, child).unwrap();
    graph
        .set_local_transform(parent, Transform::from_translation(1.0, 0.0, 0.0))
        .unwrap();
    graph
        .set_local_transform(child, Transform::from_translation(0.0, 2.0, 0.0).with_scale(2.0, 2.0, 2.0))
        .unwrap();

    let mut tree = SceneTreeCache::default();
    graph.update_node_tree(root, &mut tree).unwrap();

    assert_eq!(tree.touched, vec![root, parent, child]);
    let expected = translation(1.0, 2.0, 0.0) * Matrix4::from_scale(2.0);
    assert_eq!(graph.world_transform(child), expected);
    assert_eq!(graph.compute_world_transform(child).unwrap(), expected);
}

#[test]
fn should_touch_nothing_when_updating_twice() {
    let mut graph = SceneGraph::new();
    let root = graph.add_group("root");
    let child = graph.add_group("child");
    graph.append(root, child).unwrap();

    let mut tree = SceneTreeCache::default();
    graph.update_node_tree(root, &mut tree).unwrap();
    assert_eq!(tree.touched.len(), 2);

    graph.update_node_tree(root, &mut tree).unwrap();
    assert!(tree.touched.is_empty());
    assert!(tree.removed.is_empty());
    assert_eq!(tree.passes, 2);
}

#[test]
fn should_propagate_a_dirty_parent_to_its_subtree_only() {
    let mut graph = SceneGraph::new();
    let root = graph.add_group("root");
    let a = graph.add_group("a");
    let a_child = graph.add_group("a child");
    let b = graph.add_group("b");
    graph.append(root, a).unwrap();
    graph.append(a, a_child).unwrap();
    graph.append(root, b).unwrap();

    let mut tree = SceneTreeCache::default();
    graph.update_node_tree(root, &mut tree).unwrap();

    graph
        .set_local_transform(a, Transform::from_translation(0.0, 0.0, 5.0))
        .unwrap();
    graph.update_node_tree(root, &mut tree).unwrap();

    assert_eq!(tree.touched, vec![a, a_child]);
    assert_eq!(graph.world_transform(a_child), translation(0.0, 0.0, 5.0));
    assert_eq!(graph.world_transform(b), Matrix4::identity());
}

#[test]
fn should_reject_cycles_and_double_parenting() {
    let mut graph = SceneGraph::new();
    let a = graph.add_group("a");
    let b = graph.add_group("b");
    let c = graph.add_group("c");
    graph.append(a, b).unwrap();
    graph.append(b, c).unwrap();

    assert_eq!(
        graph.append(c, a),
        Err(StructuralError::Cycle { parent: c, child: a })
    );
    assert_eq!(
        graph.append(a, a),
        Err(StructuralError::Cycle { parent: a, child: a })
    );
    assert_eq!(
        graph.append(a, c),
        Err(StructuralError::AlreadyParented { child: c, parent: b })
    );
    assert_eq!(
        graph.remove_child(a, c),
        Err(StructuralError::NotAChild { parent: a, child: c })
    );
    // the failed calls left the tree untouched
    assert_eq!(graph.node(a).unwrap().children(), &[b]);
    assert_eq!(graph.node(c).unwrap().parent(), Some(b));
}

#[test]
fn should_report_removed_subtrees_once() {
    let mut graph = SceneGraph::new();
    let root = graph.add_group("root");
    let branch = graph.add_group("branch");
    let leaf = graph.add_group("leaf");
    graph.append(root, branch).unwrap();
    graph.append(branch, leaf).unwrap();

    let mut tree = SceneTreeCache::default();
    graph.update_node_tree(root, &mut tree).unwrap();

    graph.remove_child(root, branch).unwrap();
    graph.update_node_tree(root, &mut tree).unwrap();
    assert_eq!(tree.removed, vec![branch, leaf]);
    assert!(tree.touched.is_empty());

    graph.update_node_tree(root, &mut tree).unwrap();
    assert!(tree.removed.is_empty());
}

#[test]
fn should_recompute_a_reattached_subtree_under_its_new_parent() {
    let mut graph = SceneGraph::new();
    let root = graph.add_group("root");
    let left = graph.add_group("left");
    let right = graph.add_group("right");
    let moved = graph.add_group("moved");
    graph.append(root, left).unwrap();
    graph.append(root, right).unwrap();
    graph.append(left, moved).unwrap();
    graph
        .set_local_transform(right, Transform::from_translation(3.0, 0.0, 0.0))
        .unwrap();

    let mut tree = SceneTreeCache::default();
    graph.update_node_tree(root, &mut tree).unwrap();
    assert_eq!(graph.world_transform(moved), Matrix4::identity());

    graph.remove_child(left, moved).unwrap();
    graph.append(right, moved).unwrap();
    graph.update_node_tree(root, &mut tree).unwrap();

    assert_eq!(tree.removed, vec![moved]);
    assert_eq!(tree.touched, vec![moved]);
    assert_eq!(graph.world_transform(moved), translation(3.0, 0.0, 0.0));
}

#[test]
fn should_invalidate_ids_of_destroyed_nodes() {
    let mut graph = SceneGraph::new();
    let root = graph.add_group("root");
    let child = graph.add_group("child");
    let grandchild = graph.add_group("grandchild");
    graph.append(root, child).unwrap();
    graph.append(child, grandchild).unwrap();

    graph.destroy(child).unwrap();

    assert!(!graph.contains(child));
    assert!(!graph.contains(grandchild));
    assert!(graph.node(root).unwrap().children().is_empty());
    assert_eq!(
        graph.node(grandchild).err(),
        Some(StructuralError::UnknownNode(grandchild))
    );
    assert_eq!(graph.mark_dirty(child), Err(StructuralError::UnknownNode(child)));
    // a new node never reuses a stale id
    let fresh = graph.add_group("fresh");
    assert_ne!(fresh, child);
    assert_ne!(fresh, grandchild);
}

#[test]
fn should_bump_the_version_on_every_mutation() {
    let mut graph = SceneGraph::new();
    let node = graph.add_group("node");
    let start = graph.node(node).unwrap().version();

    graph.mark_dirty(node).unwrap();
    graph
        .set_local_transform(node, Transform::from_translation(1.0, 1.0, 1.0))
        .unwrap();
    graph.kind_mut(node).unwrap();

    assert_eq!(graph.node(node).unwrap().version(), start + 3);
    assert!(graph.node(node).unwrap().is_dirty());
}

#[test]
fn should_instantiate_templates_as_detached_subtrees() {
    let mut child = NodeTemplate::new("child", NodeKind::Group);
    child.transform = Transform::from_translation(0.0, 1.0, 0.0);
    let mut template = NodeTemplate::new("asset", NodeKind::Group);
    template.transform = Transform::from_translation(2.0, 0.0, 0.0);
    template.children.push(child);
    assert_eq!(template.node_count(), 2);

    let mut graph = SceneGraph::new();
    let root = graph.add_group("root");
    let asset = graph.instantiate(&template);
    assert_eq!(graph.node(asset).unwrap().parent(), None);

    graph.append(root, asset).unwrap();
    let mut tree = SceneTreeCache::default();
    graph.update_node_tree(root, &mut tree).unwrap();

    let child = graph.node(asset).unwrap().children()[0];
    assert_eq!(graph.node(child).unwrap().name, "child");
    assert_eq!(graph.world_transform(child), translation(2.0, 1.0, 0.0));
}
