//! Unique constraint ledger entries.
//!
//! The event log cannot express "at most one aggregate with this username".
//! Events that need such a guarantee carry [`UniqueConstraint`]s which the
//! store applies in the same transaction as the events themselves.

use crate::types::InstanceId;
use serde::{Deserialize, Serialize};

/// What a constraint does to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UniqueConstraintAction {
    /// Claim the key; fails with `AlreadyExists` if taken.
    Add,
    /// Release the key; a missing key is not an error.
    Remove,
    /// Release every key of the event's instance.
    InstanceRemove,
}

/// A ledger change bundled with a pushed event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Constraint type, e.g. `username`.
    pub unique_type: String,
    /// Constrained value.
    pub unique_field: String,
    /// Ledger action.
    pub action: UniqueConstraintAction,
    /// Message surfaced when an add collides.
    pub error_message: String,
    /// Stored under the empty instance so uniqueness spans all tenants.
    pub global: bool,
    /// Field is stored and compared lower-cased.
    pub case_insensitive: bool,
}

impl UniqueConstraint {
    /// Claims `(unique_type, unique_field)` within the event's instance.
    pub fn add(
        unique_type: impl Into<String>,
        unique_field: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            action: UniqueConstraintAction::Add,
            error_message: error_message.into(),
            global: false,
            case_insensitive: false,
        }
    }

    /// Releases `(unique_type, unique_field)` within the event's instance.
    pub fn remove(unique_type: impl Into<String>, unique_field: impl Into<String>) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            action: UniqueConstraintAction::Remove,
            error_message: String::new(),
            global: false,
            case_insensitive: false,
        }
    }

    /// Releases every key of the event's instance.
    pub const fn remove_instance() -> Self {
        Self {
            unique_type: String::new(),
            unique_field: String::new(),
            action: UniqueConstraintAction::InstanceRemove,
            error_message: String::new(),
            global: false,
            case_insensitive: false,
        }
    }

    /// Scopes the constraint to all instances.
    #[must_use]
    pub const fn global(mut self) -> Self {
        self.global = true;
        self
    }

    /// Compares the field case-insensitively.
    #[must_use]
    pub const fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Instance scope the ledger row is stored under; empty for global constraints.
    pub fn scope(&self, instance: &InstanceId) -> String {
        if self.global {
            String::new()
        } else {
            instance.to_string()
        }
    }

    /// The field as stored in the ledger.
    pub fn stored_field(&self) -> String {
        if self.case_insensitive {
            self.unique_field.to_lowercase()
        } else {
            self.unique_field.clone()
        }
    }

    /// Whether type and field are set where the action requires them.
    pub fn is_well_formed(&self) -> bool {
        match self.action {
            UniqueConstraintAction::Add | UniqueConstraintAction::Remove => {
                !self.unique_type.trim().is_empty() && !self.unique_field.trim().is_empty()
            }
            UniqueConstraintAction::InstanceRemove => true,
        }
    }
}
