//! Status enums mapping to SMALLINT lookup tables.
//!
//! Each variant's discriminant matches the seed order (1-based) of the
//! corresponding `*_statuses` table in `db/migrations`, and its name matches
//! the seeded `name` column.

use serde::{Deserialize, Serialize};

/// Status ID type matching SMALLINT/SMALLSERIAL in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = ($val:expr, $label:literal) ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Return the seeded status name.
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $label ),+
                }
            }

            /// Resolve a database status ID back into the enum.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( x if x == $val => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

define_status_enum! {
    /// Host provisioning lifecycle.
    HostStatus {
        Pending = (1, "pending"),
        Provisioning = (2, "provisioning"),
        Provisioned = (3, "provisioned"),
        Failed = (4, "failed"),
    }
}

define_status_enum! {
    /// Work attempt lifecycle: pending until the workspace is live.
    AttemptStatus {
        Pending = (1, "pending"),
        Running = (2, "running"),
        Completed = (3, "completed"),
        Failed = (4, "failed"),
    }
}

define_status_enum! {
    /// Script execution record lifecycle.
    ExecutionStatus {
        /// Queued single-script request, not yet claimed by a worker.
        Pending = (1, "pending"),
        Running = (2, "running"),
        Completed = (3, "completed"),
        Failed = (4, "failed"),
        /// Killed by the engine after exceeding its timeout.
        Terminated = (5, "terminated"),
    }
}

impl ExecutionStatus {
    /// Whether the record can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
