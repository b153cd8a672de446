//! Schema registries: labels, edge types, property keys.
//!
//! Names map to dense ids assigned in registration order. Definitions are
//! idempotent; a duplicate name returns the existing id. New definitions
//! are staged with the open transaction and reach the WAL at commit.

use crate::error::{HeronError, Result};
use crate::types::*;

use super::SingleFileDB;

impl SingleFileDB {
  // ==========================================================================
  // Labels
  // ==========================================================================

  /// Id for a label name, defining it if needed.
  pub fn get_or_create_label(&self, name: &str) -> Result<LabelId> {
    if let Some(id) = self.label_id(name) {
      return Ok(id);
    }
    let (_, tx_handle) = self.require_write_tx()?;

    let id = self.alloc_label_id();
    self.label_names.write().insert(name.to_string(), id);
    self.label_ids.write().insert(id, name.to_string());
    tx_handle.lock().staged.define_label(id, name);
    Ok(id)
  }

  pub fn label_id(&self, name: &str) -> Option<LabelId> {
    self.label_names.read().get(name).copied()
  }

  pub fn label_name(&self, id: LabelId) -> Option<String> {
    self.label_ids.read().get(&id).cloned()
  }

  /// All labels, ascending by id.
  pub fn list_labels(&self) -> Vec<(LabelId, String)> {
    let mut out: Vec<(LabelId, String)> = self
      .label_ids
      .read()
      .iter()
      .map(|(&id, name)| (id, name.clone()))
      .collect();
    out.sort_by_key(|(id, _)| *id);
    out
  }

  // ==========================================================================
  // Edge types
  // ==========================================================================

  /// Id for an edge type name, defining it if needed.
  pub fn get_or_create_etype(&self, name: &str) -> Result<ETypeId> {
    if let Some(id) = self.etype_id(name) {
      return Ok(id);
    }
    let (_, tx_handle) = self.require_write_tx()?;

    let id = self.alloc_etype_id();
    self.etype_names.write().insert(name.to_string(), id);
    self.etype_ids.write().insert(id, name.to_string());
    tx_handle.lock().staged.define_etype(id, name);
    Ok(id)
  }

  pub fn etype_id(&self, name: &str) -> Option<ETypeId> {
    self.etype_names.read().get(name).copied()
  }

  pub fn etype_name(&self, id: ETypeId) -> Option<String> {
    self.etype_ids.read().get(&id).cloned()
  }

  pub fn list_etypes(&self) -> Vec<(ETypeId, String)> {
    let mut out: Vec<(ETypeId, String)> = self
      .etype_ids
      .read()
      .iter()
      .map(|(&id, name)| (id, name.clone()))
      .collect();
    out.sort_by_key(|(id, _)| *id);
    out
  }

  // ==========================================================================
  // Property keys
  // ==========================================================================

  /// Id for a property key name, defining it if needed.
  pub fn get_or_create_propkey(&self, name: &str) -> Result<PropKeyId> {
    if let Some(id) = self.propkey_id(name) {
      return Ok(id);
    }
    let (_, tx_handle) = self.require_write_tx()?;

    let id = self.alloc_propkey_id();
    self.propkey_names.write().insert(name.to_string(), id);
    self.propkey_ids.write().insert(id, name.to_string());
    tx_handle.lock().staged.define_propkey(id, name);
    Ok(id)
  }

  pub fn propkey_id(&self, name: &str) -> Option<PropKeyId> {
    self.propkey_names.read().get(name).copied()
  }

  pub fn propkey_name(&self, id: PropKeyId) -> Option<String> {
    self.propkey_ids.read().get(&id).cloned()
  }

  pub fn list_propkeys(&self) -> Vec<(PropKeyId, String)> {
    let mut out: Vec<(PropKeyId, String)> = self
      .propkey_ids
      .read()
      .iter()
      .map(|(&id, name)| (id, name.clone()))
      .collect();
    out.sort_by_key(|(id, _)| *id);
    out
  }

  // ==========================================================================
  // Property type consistency
  // ==========================================================================

  /// Enforce that every value stored under a propkey has the same variant.
  /// The registry is seeded from WAL replay and grows on first use.
  pub(crate) fn check_prop_type(&self, key_id: PropKeyId, value: &PropValue) -> Result<()> {
    let tag = value.tag();
    {
      let types = self.prop_types.read();
      if let Some(&expected) = types.get(&key_id) {
        if expected != tag {
          return Err(HeronError::PropTypeMismatch {
            key_id,
            expected,
            got: tag,
          });
        }
        return Ok(());
      }
    }
    self.prop_types.write().entry(key_id).or_insert(tag);
    Ok(())
  }
}
