use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name(pub Uuid);

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn to_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl AsRef<Uuid> for $name {
            fn as_ref(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Identifier of a scan job.
    JobId
);

define_id!(
    /// Identifier of a tool run. Doubles as the task idempotency key.
    ToolRunId
);

define_id!(
    /// Identifier of a target record.
    TargetId
);

define_id!(
    /// Identifier of a normalized finding.
    FindingId
);

impl FindingId {
    /// Deterministic id for the `ordinal`-th finding of a tool run, so
    /// re-executing the same run replaces findings instead of adding new ones.
    pub fn derive(run: ToolRunId, ordinal: u32) -> Self {
        Self(Uuid::new_v5(&run.0, &ordinal.to_be_bytes()))
    }
}
