use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(TaskId);
id_newtype!(FieldId);

/// Lifecycle of a task. `Finished` and `Cancelled` are terminal; no
/// transition ever leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Finished,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Cancelled)
    }
}

/// Immutable identity + placeholder text for one form entry. Equality
/// and hashing are value-based so the field can serve as a map key for
/// per-field text state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormField {
    pub id: FieldId,
    pub placeholder: String,
}

impl FormField {
    pub fn new(placeholder: impl Into<String>) -> Self {
        Self {
            id: FieldId::new(),
            placeholder: placeholder.into(),
        }
    }
}
