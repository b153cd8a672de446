//! Merge-on-read: every query overlays the transaction staging (owner
//! thread only), the live delta, the frozen delta (present only while a
//! background checkpoint runs), and finally the memory-mapped snapshot.
//!
//! Layers are walked newest to oldest; the first layer with an opinion on
//! an entity wins.

use std::collections::HashMap;

use crate::core::snapshot::reader::SnapshotData;
use crate::error::{HeronError, Result};
use crate::types::*;

use super::SingleFileDB;

// ============================================================================
// Layered view
// ============================================================================

/// Delta layers ordered newest first.
pub(crate) struct DeltaLayers<'a> {
  layers: [Option<&'a DeltaState>; 3],
}

impl<'a> DeltaLayers<'a> {
  pub fn new(
    staged: Option<&'a DeltaState>,
    live: &'a DeltaState,
    frozen: Option<&'a DeltaState>,
  ) -> Self {
    Self {
      layers: [staged, Some(live), frozen],
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = &'a DeltaState> + '_ {
    self.layers.iter().flatten().copied()
  }

  /// Is the node alive as far as the deltas know? `None` = no opinion,
  /// fall through to the snapshot.
  pub fn node_alive(&self, node_id: NodeId) -> Option<bool> {
    for layer in self.iter() {
      if layer.is_node_created(node_id) {
        return Some(true);
      }
      if layer.is_node_deleted(node_id) {
        return Some(false);
      }
    }
    None
  }

  /// Is the edge present as far as the deltas know?
  pub fn edge_present(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> Option<bool> {
    for layer in self.iter() {
      if layer.is_edge_added(src, etype, dst) {
        return Some(true);
      }
      if layer.is_edge_deleted(src, etype, dst) {
        return Some(false);
      }
    }
    None
  }

  /// Node property edit, newest layer first. Outer `None` = untouched.
  pub fn node_prop(&self, node_id: NodeId, key_id: PropKeyId) -> Option<Option<PropValue>> {
    for layer in self.iter() {
      if let Some(value) = layer.node_prop(node_id, key_id) {
        return Some(value.cloned());
      }
    }
    None
  }

  /// Key lookup across layers. Outer `None` = untouched.
  pub fn key_lookup(&self, key: &str) -> Option<Option<NodeId>> {
    for layer in self.iter() {
      if let Some(&node_id) = layer.key_index.get(key) {
        return Some(Some(node_id));
      }
      if layer.key_index_deleted.contains(key) {
        return Some(None);
      }
    }
    None
  }

  /// Key recorded for a node in the deltas, if any layer created it.
  pub fn node_key(&self, node_id: NodeId) -> Option<Option<String>> {
    for layer in self.iter() {
      if let Some(node) = layer.created_nodes.get(&node_id) {
        return Some(node.key.clone());
      }
    }
    None
  }
}

// ============================================================================
// Node view
// ============================================================================

/// Materialized node returned by `get_node`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
  pub id: NodeId,
  pub key: Option<String>,
  pub labels: Vec<LabelId>,
  pub props: HashMap<PropKeyId, PropValue>,
}

// ============================================================================
// Read operations
// ============================================================================

impl SingleFileDB {
  /// Run `f` with the delta layers and the snapshot.
  pub(crate) fn with_read_view<R>(
    &self,
    f: impl FnOnce(&DeltaLayers<'_>, Option<&SnapshotData>) -> R,
  ) -> R {
    let tx_handle = self.tx_for_current_thread();
    let tx_guard = tx_handle.as_ref().map(|t| t.lock());
    let live = self.delta.read();
    let frozen_guard = self.frozen_delta.read();
    let snapshot_guard = self.snapshot.read();

    let layers = DeltaLayers::new(
      tx_guard.as_ref().map(|t| &t.staged),
      &live,
      frozen_guard.as_ref().map(|a| a.as_ref()),
    );
    f(&layers, snapshot_guard.as_ref().map(|a| a.as_ref()))
  }

  // ==========================================================================
  // Nodes
  // ==========================================================================

  /// Does a node exist?
  pub fn node_exists(&self, node_id: NodeId) -> bool {
    self.with_read_view(|layers, snapshot| match layers.node_alive(node_id) {
      Some(alive) => alive,
      None => snapshot.is_some_and(|s| s.has_node(node_id)),
    })
  }

  /// Materialize a node: key, labels, and merged properties.
  pub fn get_node(&self, node_id: NodeId) -> Option<NodeView> {
    self.with_read_view(|layers, snapshot| {
      let alive = match layers.node_alive(node_id) {
        Some(alive) => alive,
        None => snapshot.is_some_and(|s| s.has_node(node_id)),
      };
      if !alive {
        return None;
      }

      let phys = snapshot.and_then(|s| s.phys_node(node_id));

      let key = match layers.node_key(node_id) {
        Some(key) => key,
        None => match (snapshot, phys) {
          (Some(snap), Some(phys)) => snap.node_key(phys),
          _ => None,
        },
      };

      // Base properties and labels from the snapshot, then delta edits
      // oldest layer first so newer layers win.
      let mut props = match (snapshot, phys) {
        (Some(snap), Some(phys)) => snap
          .node_props(phys)
          .map(|m| m.into_iter().collect::<HashMap<_, _>>())
          .unwrap_or_default(),
        _ => HashMap::new(),
      };
      let mut labels: Vec<LabelId> = match (snapshot, phys) {
        (Some(snap), Some(phys)) => snap.node_labels(phys).unwrap_or_default(),
        _ => Vec::new(),
      };

      let layer_list: Vec<&DeltaState> = layers.iter().collect();
      for layer in layer_list.into_iter().rev() {
        if let Some(node) = layer.node_delta(node_id) {
          if let Some(node_props) = node.props.as_ref() {
            for (&key_id, value) in node_props {
              match value {
                Some(v) => {
                  props.insert(key_id, v.clone());
                }
                None => {
                  props.remove(&key_id);
                }
              }
            }
          }
          if let Some(removed) = node.labels_removed.as_ref() {
            labels.retain(|l| !removed.contains(l));
          }
          if let Some(added) = node.labels.as_ref() {
            for &label_id in added {
              if !labels.contains(&label_id) {
                labels.push(label_id);
              }
            }
          }
        }
      }
      labels.sort_unstable();

      Some(NodeView {
        id: node_id,
        key,
        labels,
        props,
      })
    })
  }

  /// Node lookup by key.
  pub fn node_by_key(&self, key: &str) -> Option<NodeId> {
    // The cache only reflects committed state; bypass it while a
    // transaction is open so staged keys resolve correctly.
    let use_cache = !self.has_transaction();
    if use_cache {
      if let Some(cached) = self.key_cache_get(key) {
        return cached;
      }
    }

    let result = self.with_read_view(|layers, snapshot| {
      if let Some(found) = layers.key_lookup(key) {
        // A hit in the deltas can still point at a node deleted later in
        // a newer layer.
        return found.filter(|&node_id| layers.node_alive(node_id).unwrap_or(true));
      }
      let node_id = snapshot.and_then(|s| s.lookup_by_key(key))?;
      match layers.node_alive(node_id) {
        Some(false) => None,
        _ => Some(node_id),
      }
    });

    if use_cache {
      self.key_cache_put(key, result);
    }
    result
  }

  /// Key of a node, if any.
  pub fn node_key(&self, node_id: NodeId) -> Option<String> {
    self.with_read_view(|layers, snapshot| {
      if layers.node_alive(node_id) == Some(false) {
        return None;
      }
      if let Some(key) = layers.node_key(node_id) {
        return key;
      }
      let snap = snapshot?;
      let phys = snap.phys_node(node_id)?;
      snap.node_key(phys)
    })
  }

  // ==========================================================================
  // Node properties
  // ==========================================================================

  /// One property of a node.
  pub fn get_node_prop(&self, node_id: NodeId, key_id: PropKeyId) -> Option<PropValue> {
    self.with_read_view(|layers, snapshot| {
      if layers.node_alive(node_id) == Some(false) {
        return None;
      }
      if let Some(edit) = layers.node_prop(node_id, key_id) {
        return edit;
      }
      let snap = snapshot?;
      let phys = snap.phys_node(node_id)?;
      snap.node_prop(phys, key_id)
    })
  }

  /// All properties of a node, or None if it does not exist.
  pub fn get_node_props(&self, node_id: NodeId) -> Option<HashMap<PropKeyId, PropValue>> {
    self.get_node(node_id).map(|view| view.props)
  }

  // ==========================================================================
  // Labels
  // ==========================================================================

  /// All labels of a node.
  pub fn node_labels(&self, node_id: NodeId) -> Option<Vec<LabelId>> {
    self.get_node(node_id).map(|view| view.labels)
  }

  pub fn node_has_label(&self, node_id: NodeId, label_id: LabelId) -> bool {
    self
      .node_labels(node_id)
      .is_some_and(|labels| labels.contains(&label_id))
  }

  // ==========================================================================
  // Edges
  // ==========================================================================

  /// Does the edge exist?
  pub fn edge_exists(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> bool {
    self.with_read_view(|layers, snapshot| {
      let src_alive = match layers.node_alive(src) {
        Some(alive) => alive,
        None => snapshot.is_some_and(|s| s.has_node(src)),
      };
      let dst_alive = match layers.node_alive(dst) {
        Some(alive) => alive,
        None => snapshot.is_some_and(|s| s.has_node(dst)),
      };
      if !src_alive || !dst_alive {
        return false;
      }

      match layers.edge_present(src, etype, dst) {
        Some(present) => present,
        None => snapshot.is_some_and(|s| {
          match (s.phys_node(src), s.phys_node(dst)) {
            (Some(src_phys), Some(dst_phys)) => s.has_edge(src_phys, etype, dst_phys),
            _ => false,
          }
        }),
      }
    })
  }

  /// Outgoing edges `(etype, dst)`, optionally filtered by type.
  pub fn out_edges(&self, node_id: NodeId, etype_filter: Option<ETypeId>) -> Vec<(ETypeId, NodeId)> {
    self.neighbors(node_id, etype_filter, true)
  }

  /// Incoming edges `(etype, src)`, optionally filtered by type.
  pub fn in_edges(&self, node_id: NodeId, etype_filter: Option<ETypeId>) -> Vec<(ETypeId, NodeId)> {
    self.neighbors(node_id, etype_filter, false)
  }

  pub fn out_degree(&self, node_id: NodeId) -> usize {
    self.out_edges(node_id, None).len()
  }

  pub fn in_degree(&self, node_id: NodeId) -> usize {
    self.in_edges(node_id, None).len()
  }

  /// Outgoing neighbors along one edge type.
  pub fn out_neighbors(&self, node_id: NodeId, etype: ETypeId) -> Vec<NodeId> {
    self
      .out_edges(node_id, Some(etype))
      .into_iter()
      .map(|(_, other)| other)
      .collect()
  }

  /// Incoming neighbors along one edge type.
  pub fn in_neighbors(&self, node_id: NodeId, etype: ETypeId) -> Vec<NodeId> {
    self
      .in_edges(node_id, Some(etype))
      .into_iter()
      .map(|(_, other)| other)
      .collect()
  }

  fn neighbors(
    &self,
    node_id: NodeId,
    etype_filter: Option<ETypeId>,
    outgoing: bool,
  ) -> Vec<(ETypeId, NodeId)> {
    self.with_read_view(|layers, snapshot| {
      let self_alive = match layers.node_alive(node_id) {
        Some(alive) => alive,
        None => snapshot.is_some_and(|s| s.has_node(node_id)),
      };
      if !self_alive {
        return Vec::new();
      }

      let other_alive = |other: NodeId| match layers.node_alive(other) {
        Some(alive) => alive,
        None => snapshot.is_some_and(|s| s.has_node(other)),
      };
      let edge_alive = |other: NodeId, etype: ETypeId, base: bool| {
        let (src, dst) = if outgoing {
          (node_id, other)
        } else {
          (other, node_id)
        };
        layers.edge_present(src, etype, dst).unwrap_or(base)
      };

      let mut edges: Vec<(ETypeId, NodeId)> = Vec::new();

      // Snapshot edges, minus deltas that removed them
      if let Some(snap) = snapshot {
        if let Some(phys) = snap.phys_node(node_id) {
          let iter = if outgoing {
            snap.iter_out_edges(phys)
          } else {
            snap.iter_in_edges(phys)
          };
          for (other_phys, etype) in iter {
            if etype_filter.is_some_and(|f| f != etype) {
              continue;
            }
            let Some(other) = snap.node_id(other_phys) else {
              continue;
            };
            if !other_alive(other) {
              continue;
            }
            if edge_alive(other, etype, true) {
              edges.push((etype, other));
            }
          }
        }
      }

      // Delta additions (all layers), minus removals in newer layers
      for layer in layers.iter() {
        let adds = if outgoing { &layer.out_add } else { &layer.in_add };
        if let Some(patches) = adds.get(&node_id) {
          for patch in patches {
            if etype_filter.is_some_and(|f| f != patch.etype) {
              continue;
            }
            if !other_alive(patch.other) {
              continue;
            }
            if !edge_alive(patch.other, patch.etype, false) {
              continue;
            }
            if !edges.contains(&(patch.etype, patch.other)) {
              edges.push((patch.etype, patch.other));
            }
          }
        }
      }

      edges.sort_unstable();
      edges.dedup();
      edges
    })
  }

  // ==========================================================================
  // Edge properties
  // ==========================================================================

  /// One property of an edge. None if the edge or property is absent.
  pub fn get_edge_prop(
    &self,
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
    key_id: PropKeyId,
  ) -> Option<PropValue> {
    if !self.edge_exists(src, etype, dst) {
      return None;
    }
    self.with_read_view(|layers, snapshot| {
      for layer in layers.iter() {
        if let Some(props) = layer.edge_props_delta(src, etype, dst) {
          if let Some(value) = props.get(&key_id) {
            return value.clone();
          }
        }
      }
      let snap = snapshot?;
      let src_phys = snap.phys_node(src)?;
      let dst_phys = snap.phys_node(dst)?;
      let edge_idx = snap.find_edge_index(src_phys, etype, dst_phys)?;
      snap.edge_prop(edge_idx, key_id)
    })
  }

  /// All properties of an edge, or None if the edge is absent.
  pub fn get_edge_props(
    &self,
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
  ) -> Option<HashMap<PropKeyId, PropValue>> {
    if !self.edge_exists(src, etype, dst) {
      return None;
    }
    Some(self.with_read_view(|layers, snapshot| {
      let mut props: HashMap<PropKeyId, PropValue> = snapshot
        .and_then(|snap| {
          let src_phys = snap.phys_node(src)?;
          let dst_phys = snap.phys_node(dst)?;
          let edge_idx = snap.find_edge_index(src_phys, etype, dst_phys)?;
          snap.edge_props(edge_idx)
        })
        .map(|m| m.into_iter().collect())
        .unwrap_or_default();

      let layer_list: Vec<&DeltaState> = layers.iter().collect();
      for layer in layer_list.into_iter().rev() {
        if let Some(edits) = layer.edge_props_delta(src, etype, dst) {
          for (&key_id, value) in edits {
            match value {
              Some(v) => {
                props.insert(key_id, v.clone());
              }
              None => {
                props.remove(&key_id);
              }
            }
          }
        }
      }
      props
    }))
  }

  // ==========================================================================
  // Existence guards used by the write path
  // ==========================================================================

  pub(crate) fn require_node(&self, node_id: NodeId) -> Result<()> {
    if self.node_exists(node_id) {
      Ok(())
    } else {
      Err(HeronError::NodeNotFound(node_id))
    }
  }
}
