// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Identifier newtypes and ID generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for truncating identifiers to a short prefix.
pub trait ShortId {
    /// Returns a string slice truncated to at most `n` characters.
    fn short(&self, n: usize) -> &str;
}

impl ShortId for str {
    fn short(&self, n: usize) -> &str {
        if self.len() <= n {
            self
        } else {
            &self[..n]
        }
    }
}

/// Define a newtype ID wrapper around `String`.
///
/// Generates `new()`, `as_str()`, `short()`, `Display`, `From<String>`, `From<&str>`,
/// `PartialEq<str>`, `PartialEq<&str>`, and `Borrow<str>` implementations.
#[macro_export]
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        pub struct $name:ident;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns a string slice truncated to at most `n` characters.
            pub fn short(&self, n: usize) -> &str {
                if self.0.len() <= n {
                    &self.0
                } else {
                    &self.0[..n]
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

crate::define_id! {
    /// Unique identifier for a session (the user-visible unit of work).
    #[derive(Default)]
    pub struct SessionId;
}

crate::define_id! {
    /// Unique identifier for a kernel (one container within a session).
    #[derive(Default)]
    pub struct KernelId;
}

crate::define_id! {
    /// Unique identifier for a worker agent (one node of the fleet).
    pub struct AgentId;
}

crate::define_id! {
    /// Name of a resource group (an independent scheduling domain).
    #[derive(Default)]
    pub struct ResourceGroupId;
}

crate::define_id! {
    /// Correlation id carried by every southbound RPC.
    pub struct RequestId;
}

/// Trait for generating unique IDs (allows deterministic IDs in tests).
pub trait IdGen: Send + Sync {
    fn session_id(&self) -> SessionId;
    fn kernel_id(&self) -> KernelId;
    fn request_id(&self) -> RequestId;
}

/// Production ID generator backed by UUID v4.
#[derive(Clone, Default)]
pub struct UuidIdGen;

impl IdGen for UuidIdGen {
    fn session_id(&self) -> SessionId {
        SessionId::new(uuid::Uuid::new_v4().to_string())
    }

    fn kernel_id(&self) -> KernelId {
        KernelId::new(uuid::Uuid::new_v4().to_string())
    }

    fn request_id(&self) -> RequestId {
        RequestId::new(uuid::Uuid::new_v4().to_string())
    }
}

/// Sequential ID generator for deterministic tests.
#[derive(Clone, Default)]
pub struct SeqIdGen {
    counter: Arc<AtomicU64>,
}

impl SeqIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{n}")
    }
}

impl IdGen for SeqIdGen {
    fn session_id(&self) -> SessionId {
        SessionId::new(self.next("sess"))
    }

    fn kernel_id(&self) -> KernelId {
        KernelId::new(self.next("kern"))
    }

    fn request_id(&self) -> RequestId {
        RequestId::new(self.next("req"))
    }
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
