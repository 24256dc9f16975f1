use sea_orm::Value;

use crate::errors::{DataError, DataResult};

/// Explicit set of field updates for `WriteRepository::update`.
///
/// Field names are checked against the entity's mutable-field whitelist
/// before any SQL is built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldPatch {
    fields: Vec<(String, Value)>,
}

impl FieldPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `field` to `value`, replacing an earlier value for the same field.
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| name == field) {
            Some(entry) => entry.1 = value,
            None => self.fields.push((field.to_string(), value)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Fail with a validation error naming every field outside `allowed`.
    pub fn ensure_allowed(&self, allowed: &[&str]) -> DataResult<()> {
        if self.is_empty() {
            return Err(DataError::validation("patch does not set any field"));
        }

        let rejected: Vec<&str> = self
            .fields
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| !allowed.contains(name))
            .collect();
        if rejected.is_empty() {
            Ok(())
        } else {
            Err(DataError::validation(format!(
                "fields not updatable: {}",
                rejected.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_existing_field() {
        let patch = FieldPatch::new().set("status", "paid").set("status", "shipped");
        assert_eq!(patch.len(), 1);
        assert_eq!(patch.fields()[0].1, Value::from("shipped"));
    }

    #[test]
    fn test_ensure_allowed_lists_rejected_fields() {
        let patch = FieldPatch::new()
            .set("status", "paid")
            .set("id", 5i64)
            .set("version", 9i64);

        let err = patch.ensure_allowed(&["status", "total_cents"]).err().unwrap();
        assert_eq!(err.to_string(), "fields not updatable: id, version");
    }

    #[test]
    fn test_empty_patch_is_rejected() {
        assert!(FieldPatch::new().ensure_allowed(&["status"]).is_err());
    }
}
