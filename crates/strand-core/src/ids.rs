//! Identifier newtypes.
//!
//! All identifiers are assigned by the control plane. Zero means
//! "unassigned" and is never a valid registry key.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Whether this identifier is the unassigned value.
            #[must_use]
            pub fn is_zero(self) -> bool {
                self.0 == 0
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }

        impl From<$name> for u64 {
            fn from(v: $name) -> u64 {
                v.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a node (device) in the mesh.
    PeerId
);
id_type!(
    /// Identifier of the user owning one or more nodes.
    UserId
);
id_type!(
    /// Identifier of a network grouping peers.
    NetworkId
);
id_type!(
    /// Identifier of a relay server.
    ServerId
);
