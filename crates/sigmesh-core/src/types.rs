//! Domain-tagged 64-bit type identities.
//!
//! Every runtime-visible kind of thing — node types, extension types, signal
//! types, policy types, field names, action names — is identified on the wire
//! and in storage by a 64-bit hash of a domain-tagged string constant. The
//! domain tag keeps the namespaces separate: `hash("ExtType", "GROUP")` and
//! `hash("SignalType", "GROUP")` never alias by construction.
//!
//! Hash collisions between registered names are treated as configuration
//! errors and are detected at registration time (see the context registry),
//! never at dispatch time.

use sha2::{Digest, Sha512};

/// Computes the domain-tagged hash for a named constant.
///
/// The digest input is `base ‖ 0x00 ‖ name`; the hash is the first eight
/// bytes of the SHA-512 digest, big-endian. This is stable across platforms
/// and releases and is part of the wire and storage formats.
#[must_use]
pub fn type_hash(base: &str, name: &str) -> u64 {
    let mut hasher = Sha512::new();
    hasher.update(base.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Domain tag for extension types.
pub const EXT_TYPE_BASE: &str = "ExtType";
/// Domain tag for node types.
pub const NODE_TYPE_BASE: &str = "NodeType";
/// Domain tag for signal types.
pub const SIGNAL_TYPE_BASE: &str = "SignalType";
/// Domain tag for policy types.
pub const POLICY_TYPE_BASE: &str = "PolicyType";
/// Domain tag for serialized value shapes.
pub const VALUE_TYPE_BASE: &str = "ValueType";
/// Domain tag for extension field names (used in read permission trees).
pub const FIELD_NAME_BASE: &str = "FieldName";
/// Domain tag for lock action names.
pub const LOCK_ACTION_BASE: &str = "LockAction";
/// Domain tag for link action names.
pub const LINK_ACTION_BASE: &str = "LinkAction";

macro_rules! tagged_hash_type {
    ($(#[$doc:meta])* $name:ident, $base:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            /// Derives the type identity for `name` in this domain.
            #[must_use]
            pub fn new(name: &str) -> Self {
                Self(type_hash($base, name))
            }

            /// Returns the raw 64-bit hash.
            #[must_use]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }
    };
}

tagged_hash_type!(
    /// Identity of an extension kind.
    ExtType,
    EXT_TYPE_BASE
);
tagged_hash_type!(
    /// Identity of a node kind; determines the required extension set.
    NodeType,
    NODE_TYPE_BASE
);
tagged_hash_type!(
    /// Identity of a signal variant on the wire.
    SignalType,
    SIGNAL_TYPE_BASE
);
tagged_hash_type!(
    /// Identity of a policy variant in storage.
    PolicyType,
    POLICY_TYPE_BASE
);

/// Hashes an extension field name for use in read permission trees.
#[must_use]
pub fn field_tag(name: &str) -> u64 {
    type_hash(FIELD_NAME_BASE, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = type_hash(SIGNAL_TYPE_BASE, "LOCK");
        let b = type_hash(SIGNAL_TYPE_BASE, "LOCK");
        assert_eq!(a, b);
    }

    #[test]
    fn domains_do_not_alias() {
        assert_ne!(
            type_hash(EXT_TYPE_BASE, "GROUP"),
            type_hash(SIGNAL_TYPE_BASE, "GROUP")
        );
        assert_ne!(ExtType::new("GROUP").raw(), NodeType::new("GROUP").raw());
    }

    #[test]
    fn separator_prevents_concatenation_aliasing() {
        // "AB" + "C" must not hash like "A" + "BC".
        assert_ne!(type_hash("AB", "C"), type_hash("A", "BC"));
    }

    #[test]
    fn display_is_hex() {
        let t = SignalType::new("LOCK");
        let shown = t.to_string();
        assert!(shown.starts_with("0x"));
        assert_eq!(shown.len(), 18);
    }
}
