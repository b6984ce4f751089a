use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(TaskId);
string_id!(WorkerId);
string_id!(UserId);
string_id!(ProposalId);

/// Prefix identifying a synthetic multi-stop (bundle) task id.
pub const BUNDLE_ID_PREFIX: &str = "group-";

impl TaskId {
    /// Build the synthetic id representing a whole bundle.
    pub fn for_bundle(bundle_id: &str) -> Self {
        Self(format!("{BUNDLE_ID_PREFIX}{bundle_id}"))
    }

    /// The bundle id when this is a synthetic `group-<id>` task id.
    pub fn as_bundle(&self) -> Option<&str> {
        self.0.strip_prefix(BUNDLE_ID_PREFIX)
    }

    pub fn is_bundle(&self) -> bool {
        self.as_bundle().is_some()
    }
}
