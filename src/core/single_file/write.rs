//! Mutation operations: nodes, edges, labels, properties.
//!
//! Every mutation requires the open write transaction and stages into its
//! delta; nothing reaches the WAL until commit. Validation happens here,
//! against the merged view, so a failed operation leaves the transaction
//! usable.

use crate::error::{HeronError, Result};
use crate::types::*;

use super::SingleFileDB;

impl SingleFileDB {
  // ==========================================================================
  // Nodes
  // ==========================================================================

  /// Create a node, optionally keyed. Keys are unique across the database.
  pub fn create_node(&self, key: Option<&str>) -> Result<NodeId> {
    let (_, tx_handle) = self.require_write_tx()?;

    if let Some(key) = key {
      if self.node_by_key(key).is_some() {
        return Err(HeronError::DuplicateKey(key.to_string()));
      }
    }

    let node_id = self.alloc_node_id();
    tx_handle.lock().staged.create_node(node_id, key);
    Ok(node_id)
  }

  /// Create a node with labels and properties in one call.
  pub fn create_node_with(
    &self,
    key: Option<&str>,
    labels: &[LabelId],
    props: Vec<(PropKeyId, PropValue)>,
  ) -> Result<NodeId> {
    let node_id = self.create_node(key)?;
    for &label_id in labels {
      self.add_node_label(node_id, label_id)?;
    }
    for (key_id, value) in props {
      self.set_node_prop(node_id, key_id, value)?;
    }
    Ok(node_id)
  }

  /// Delete a node. Its key mapping, labels, properties, edges, and
  /// vectors go with it.
  pub fn delete_node(&self, node_id: NodeId) -> Result<()> {
    let (_, tx_handle) = self.require_write_tx()?;
    self.require_node(node_id)?;

    let key = self.node_key(node_id);

    let mut tx = tx_handle.lock();
    tx.staged.delete_node(node_id);
    if let Some(key) = key {
      tx.staged.key_index.remove(&key);
      tx.staged.key_index_deleted.insert(key);
    }
    Ok(())
  }

  // ==========================================================================
  // Node labels
  // ==========================================================================

  /// Attach a label to a node. Idempotent.
  pub fn add_node_label(&self, node_id: NodeId, label_id: LabelId) -> Result<()> {
    let (_, tx_handle) = self.require_write_tx()?;
    self.require_node(node_id)?;
    tx_handle.lock().staged.add_node_label(node_id, label_id);
    Ok(())
  }

  /// Detach a label from a node. Idempotent.
  pub fn remove_node_label(&self, node_id: NodeId, label_id: LabelId) -> Result<()> {
    let (_, tx_handle) = self.require_write_tx()?;
    self.require_node(node_id)?;
    tx_handle.lock().staged.remove_node_label(node_id, label_id);
    Ok(())
  }

  // ==========================================================================
  // Edges
  // ==========================================================================

  /// Add an edge. Self edges are rejected, both endpoints must be live,
  /// and adding an existing edge is a no-op.
  pub fn add_edge(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> Result<()> {
    let (_, tx_handle) = self.require_write_tx()?;

    if src == dst {
      return Err(HeronError::SelfEdge(src));
    }
    if !self.node_exists(src) {
      return Err(HeronError::EdgeEndpointMissing(src));
    }
    if !self.node_exists(dst) {
      return Err(HeronError::EdgeEndpointMissing(dst));
    }
    if self.edge_exists(src, etype, dst) {
      return Ok(());
    }

    tx_handle.lock().staged.add_edge(src, etype, dst);
    Ok(())
  }

  /// Add an edge by type name, defining the type if needed.
  pub fn add_edge_by_name(&self, src: NodeId, etype_name: &str, dst: NodeId) -> Result<()> {
    let etype = self.get_or_create_etype(etype_name)?;
    self.add_edge(src, etype, dst)
  }

  /// Delete an edge. Deleting a missing edge is a no-op.
  pub fn delete_edge(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> Result<()> {
    let (_, tx_handle) = self.require_write_tx()?;

    if !self.edge_exists(src, etype, dst) {
      return Ok(());
    }

    tx_handle.lock().staged.delete_edge(src, etype, dst);
    Ok(())
  }

  // ==========================================================================
  // Node properties
  // ==========================================================================

  /// Set a node property. The value variant must match every other value
  /// stored under the same key.
  pub fn set_node_prop(&self, node_id: NodeId, key_id: PropKeyId, value: PropValue) -> Result<()> {
    let (_, tx_handle) = self.require_write_tx()?;
    self.require_node(node_id)?;
    self.check_prop_type(key_id, &value)?;
    tx_handle.lock().staged.set_node_prop(node_id, key_id, value);
    Ok(())
  }

  /// Set a node property by key name, defining the key if needed.
  pub fn set_node_prop_by_name(
    &self,
    node_id: NodeId,
    key_name: &str,
    value: PropValue,
  ) -> Result<()> {
    let key_id = self.get_or_create_propkey(key_name)?;
    self.set_node_prop(node_id, key_id, value)
  }

  /// Delete a node property. Idempotent.
  pub fn delete_node_prop(&self, node_id: NodeId, key_id: PropKeyId) -> Result<()> {
    let (_, tx_handle) = self.require_write_tx()?;
    self.require_node(node_id)?;
    tx_handle.lock().staged.delete_node_prop(node_id, key_id);
    Ok(())
  }

  // ==========================================================================
  // Edge properties
  // ==========================================================================

  /// Set an edge property. The edge must exist.
  pub fn set_edge_prop(
    &self,
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
    key_id: PropKeyId,
    value: PropValue,
  ) -> Result<()> {
    let (_, tx_handle) = self.require_write_tx()?;
    if !self.edge_exists(src, etype, dst) {
      return Err(HeronError::EdgeNotFound { src, etype, dst });
    }
    self.check_prop_type(key_id, &value)?;
    tx_handle
      .lock()
      .staged
      .set_edge_prop(src, etype, dst, key_id, value);
    Ok(())
  }

  /// Delete an edge property. The edge must exist; a missing property is
  /// a no-op.
  pub fn delete_edge_prop(
    &self,
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
    key_id: PropKeyId,
  ) -> Result<()> {
    let (_, tx_handle) = self.require_write_tx()?;
    if !self.edge_exists(src, etype, dst) {
      return Err(HeronError::EdgeNotFound { src, etype, dst });
    }
    tx_handle
      .lock()
      .staged
      .delete_edge_prop(src, etype, dst, key_id);
    Ok(())
  }
}
