//! Canonical binary encoding of signals and stored state.
//!
//! Every signal has exactly one byte representation:
//!
//! ```text
//! +-------------+-------------+---------------+--------------+
//! | magic (u32) | type (u64)  | length (u64)  | body         |
//! +-------------+-------------+---------------+--------------+
//! ```
//!
//! all big-endian. The body is a marshaled [`SerializedValue`]: an ordered
//! stack of 64-bit shape tags followed by a data blob whose layout the
//! stack describes. The same value encoding carries extension state and
//! node records into storage.
//!
//! Decoding is strict: the declared length must equal the body length
//! exactly, a magic or shape mismatch is a hard error, and every decoder
//! must consume its input completely. Lengths are validated before any
//! allocation so a hostile blob cannot force oversized buffers.

// Every reader method fails the same way: with the WireError it returns.
#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::LazyLock;

use ed25519_dalek::{Signature, VerifyingKey};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{NodeId, NODE_ID_LEN};
use crate::policy::Tree;
use crate::signal::{Direction, LinkAction, LockAction, Signal, SignalBody, SignalKind};
use crate::types::{type_hash, ExtType, NodeType, VALUE_TYPE_BASE};

/// Magic prefix of every encoded signal.
pub const SIGNAL_MAGIC: u32 = 0x753a_64de;

/// Size of the signal envelope header (magic + type + length).
pub const SIGNAL_HEADER_LEN: usize = 4 + 8 + 8;

/// Nesting bound for capability trees on the decode path.
const MAX_TREE_DEPTH: usize = 64;

/// Errors from encoding or decoding wire values.
#[derive(Debug, Error)]
pub enum WireError {
    /// Input ended before a declared field.
    #[error("truncated input: needed {needed} more bytes for {context}")]
    Truncated {
        /// Bytes still required.
        needed: usize,
        /// What was being read.
        context: &'static str,
    },

    /// The envelope magic did not match.
    #[error("bad magic: {found:#010x}")]
    BadMagic {
        /// The magic value found.
        found: u32,
    },

    /// The envelope named a signal type that is not registered.
    #[error("unknown signal type {0:#018x}")]
    UnknownSignalType(u64),

    /// A stored record named a policy type that is not registered.
    #[error("unknown policy type {0:#018x}")]
    UnknownPolicyType(u64),

    /// A stored record named an extension type that is not registered.
    #[error("unknown extension type {0:#018x}")]
    UnknownExtType(u64),

    /// A stored record named a node type that is not registered.
    #[error("unknown node type {0:#018x}")]
    UnknownNodeType(u64),

    /// The declared body length did not match the actual body.
    #[error("length mismatch: declared {declared}, body has {actual}")]
    LengthMismatch {
        /// Length from the envelope.
        declared: u64,
        /// Bytes actually present.
        actual: usize,
    },

    /// A shape tag did not match the schema.
    #[error("shape mismatch while reading {context}")]
    ShapeMismatch {
        /// What was being read.
        context: &'static str,
    },

    /// A decoder finished with input left over.
    #[error("trailing bytes after decode: {types} shape tags, {bytes} data bytes")]
    Trailing {
        /// Unconsumed shape tags.
        types: usize,
        /// Unconsumed data bytes.
        bytes: usize,
    },

    /// An enum byte was out of range.
    #[error("invalid {context} byte: {value:#04x}")]
    BadEnumByte {
        /// Which enum was being read.
        context: &'static str,
        /// The offending byte.
        value: u8,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    BadString,

    /// Raw public key bytes were not a valid curve point.
    #[error("invalid public key bytes")]
    InvalidKey,

    /// A capability tree nested past the decode bound.
    #[error("capability tree nested deeper than {MAX_TREE_DEPTH}")]
    TreeTooDeep,
}

/// Shape tags for the value encoding, hashed once at startup.
pub(crate) struct ValueTags {
    pub u8_: u64,
    pub u32_: u64,
    pub u64_: u64,
    pub string: u64,
    pub uuid: u64,
    pub node_id: u64,
    pub public_key: u64,
    pub signature: u64,
    pub option: u64,
    pub vec: u64,
    pub map: u64,
    pub tree: u64,
    pub value: u64,
    pub secret_key: u64,
}

static TAGS: LazyLock<ValueTags> = LazyLock::new(|| ValueTags {
    u8_: type_hash(VALUE_TYPE_BASE, "uint8"),
    u32_: type_hash(VALUE_TYPE_BASE, "uint32"),
    u64_: type_hash(VALUE_TYPE_BASE, "uint64"),
    string: type_hash(VALUE_TYPE_BASE, "string"),
    uuid: type_hash(VALUE_TYPE_BASE, "uuid"),
    node_id: type_hash(VALUE_TYPE_BASE, "node_id"),
    public_key: type_hash(VALUE_TYPE_BASE, "public_key"),
    signature: type_hash(VALUE_TYPE_BASE, "signature"),
    option: type_hash(VALUE_TYPE_BASE, "option"),
    vec: type_hash(VALUE_TYPE_BASE, "vec"),
    map: type_hash(VALUE_TYPE_BASE, "map"),
    tree: type_hash(VALUE_TYPE_BASE, "tree"),
    value: type_hash(VALUE_TYPE_BASE, "value"),
    secret_key: type_hash(VALUE_TYPE_BASE, "secret_key"),
});

pub(crate) fn value_tags() -> &'static ValueTags {
    &TAGS
}

static SIGNAL_KINDS: LazyLock<HashMap<u64, SignalKind>> = LazyLock::new(|| {
    SignalKind::ALL
        .iter()
        .map(|kind| (kind.signal_type().raw(), *kind))
        .collect()
});

/// Looks up a signal kind by its wire type hash.
#[must_use]
pub fn signal_kind_for(type_hash: u64) -> Option<SignalKind> {
    SIGNAL_KINDS.get(&type_hash).copied()
}

/// A shape-tagged value blob: the unit of the body encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedValue {
    /// Ordered shape tags describing the concrete layout of `data`.
    pub type_stack: Vec<u64>,
    /// The data blob.
    pub data: Vec<u8>,
}

impl SerializedValue {
    /// Marshals to `[n_types: u64][data_len: u64][types…][data]`.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.type_stack.len() * 8 + self.data.len());
        out.extend_from_slice(&(self.type_stack.len() as u64).to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u64).to_be_bytes());
        for tag in &self.type_stack {
            out.extend_from_slice(&tag.to_be_bytes());
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// Parses one marshaled value, returning it and the remaining input.
    ///
    /// Lengths are validated against the available input before any
    /// allocation.
    ///
    /// # Errors
    ///
    /// [`WireError::Truncated`] when the input is shorter than the declared
    /// lengths.
    pub fn parse(input: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if input.len() < 16 {
            return Err(WireError::Truncated {
                needed: 16 - input.len(),
                context: "value header",
            });
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&input[0..8]);
        let n_types = u64::from_be_bytes(word) as usize;
        word.copy_from_slice(&input[8..16]);
        let data_len = u64::from_be_bytes(word) as usize;

        let total = n_types
            .checked_mul(8)
            .and_then(|t| t.checked_add(16))
            .and_then(|t| t.checked_add(data_len))
            .ok_or(WireError::Truncated {
                needed: usize::MAX,
                context: "value lengths",
            })?;
        if input.len() < total {
            return Err(WireError::Truncated {
                needed: total - input.len(),
                context: "value payload",
            });
        }

        let mut type_stack = Vec::with_capacity(n_types);
        for i in 0..n_types {
            word.copy_from_slice(&input[16 + i * 8..24 + i * 8]);
            type_stack.push(u64::from_be_bytes(word));
        }
        let data_start = 16 + n_types * 8;
        let data = input[data_start..data_start + data_len].to_vec();
        Ok((Self { type_stack, data }, &input[total..]))
    }
}

/// Builds one [`SerializedValue`] field by field.
///
/// Shape tags and data bytes are pushed separately so collections can
/// declare their element shape once while writing raw element data per
/// entry — the invariant the reader relies on.
#[derive(Debug, Default)]
pub struct ValueWriter {
    stack: Vec<u64>,
    data: Vec<u8>,
}

impl ValueWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a raw shape tag.
    pub fn tag(&mut self, tag: u64) {
        self.stack.push(tag);
    }

    /// Appends a raw byte.
    pub fn raw_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    /// Appends a raw big-endian u32.
    pub fn raw_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a raw big-endian u64.
    pub fn raw_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a length-prefixed string.
    pub fn raw_string(&mut self, value: &str) {
        self.raw_u64(value.len() as u64);
        self.data.extend_from_slice(value.as_bytes());
    }

    /// Appends raw UUID bytes.
    pub fn raw_uuid(&mut self, value: Uuid) {
        self.data.extend_from_slice(value.as_bytes());
    }

    /// Appends raw node id bytes.
    pub fn raw_node_id(&mut self, value: NodeId) {
        self.data.extend_from_slice(value.as_bytes());
    }

    /// Appends raw public key bytes.
    pub fn raw_public_key(&mut self, value: &VerifyingKey) {
        self.data.extend_from_slice(value.as_bytes());
    }

    /// Appends raw signature bytes.
    pub fn raw_signature(&mut self, value: &Signature) {
        self.data.extend_from_slice(&value.to_bytes());
    }

    /// Appends a presence flag byte.
    pub fn raw_flag(&mut self, present: bool) {
        self.data.push(u8::from(present));
    }

    /// Appends a recursively encoded capability tree.
    pub fn raw_tree(&mut self, tree: &Tree) {
        self.raw_u64(tree.0.len() as u64);
        for (tag, sub) in &tree.0 {
            self.raw_u64(*tag);
            self.raw_tree(sub);
        }
    }

    /// Appends a nested marshaled value (self-delimiting).
    pub fn raw_value(&mut self, value: &SerializedValue) {
        self.data.extend_from_slice(&value.marshal());
    }

    /// Tagged u8.
    pub fn push_u8(&mut self, value: u8) {
        self.tag(TAGS.u8_);
        self.raw_u8(value);
    }

    /// Tagged u32.
    pub fn push_u32(&mut self, value: u32) {
        self.tag(TAGS.u32_);
        self.raw_u32(value);
    }

    /// Tagged u64.
    pub fn push_u64(&mut self, value: u64) {
        self.tag(TAGS.u64_);
        self.raw_u64(value);
    }

    /// Tagged string.
    pub fn push_string(&mut self, value: &str) {
        self.tag(TAGS.string);
        self.raw_string(value);
    }

    /// Tagged UUID.
    pub fn push_uuid(&mut self, value: Uuid) {
        self.tag(TAGS.uuid);
        self.raw_uuid(value);
    }

    /// Tagged node id.
    pub fn push_node_id(&mut self, value: NodeId) {
        self.tag(TAGS.node_id);
        self.raw_node_id(value);
    }

    /// Tagged public key.
    pub fn push_public_key(&mut self, value: &VerifyingKey) {
        self.tag(TAGS.public_key);
        self.raw_public_key(value);
    }

    /// Tagged signature.
    pub fn push_signature(&mut self, value: &Signature) {
        self.tag(TAGS.signature);
        self.raw_signature(value);
    }

    /// Tagged optional UUID.
    pub fn push_option_uuid(&mut self, value: Option<Uuid>) {
        self.tag(TAGS.option);
        self.tag(TAGS.uuid);
        self.raw_flag(value.is_some());
        if let Some(id) = value {
            self.raw_uuid(id);
        }
    }

    /// Tagged optional node id.
    pub fn push_option_node_id(&mut self, value: Option<NodeId>) {
        self.tag(TAGS.option);
        self.tag(TAGS.node_id);
        self.raw_flag(value.is_some());
        if let Some(id) = value {
            self.raw_node_id(id);
        }
    }

    /// Tagged string list.
    pub fn push_string_list<'a, I: IntoIterator<Item = &'a str>>(&mut self, items: I) {
        self.tag(TAGS.vec);
        self.tag(TAGS.string);
        let items: Vec<&str> = items.into_iter().collect();
        self.raw_u64(items.len() as u64);
        for item in items {
            self.raw_string(item);
        }
    }

    /// Tagged capability tree.
    pub fn push_tree(&mut self, tree: &Tree) {
        self.tag(TAGS.tree);
        self.raw_tree(tree);
    }

    /// Tagged 32-byte signing secret (storage records only).
    pub fn push_secret_key(&mut self, bytes: &[u8; 32]) {
        self.tag(TAGS.secret_key);
        self.data.extend_from_slice(bytes);
    }

    /// Finishes the value.
    #[must_use]
    pub fn finish(self) -> SerializedValue {
        SerializedValue {
            type_stack: self.stack,
            data: self.data,
        }
    }
}

/// Reads one [`SerializedValue`] field by field, mirroring [`ValueWriter`].
#[derive(Debug)]
pub struct ValueReader<'a> {
    stack: &'a [u64],
    data: &'a [u8],
}

impl<'a> ValueReader<'a> {
    /// Starts reading a value.
    #[must_use]
    pub fn new(value: &'a SerializedValue) -> Self {
        Self {
            stack: &value.type_stack,
            data: &value.data,
        }
    }

    /// Consumes one shape tag and requires it to match.
    ///
    /// # Errors
    ///
    /// [`WireError::ShapeMismatch`] if the next tag is absent or different.
    pub fn expect_tag(&mut self, tag: u64, context: &'static str) -> Result<(), WireError> {
        match self.stack.split_first() {
            Some((found, rest)) if *found == tag => {
                self.stack = rest;
                Ok(())
            }
            _ => Err(WireError::ShapeMismatch { context }),
        }
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], WireError> {
        if self.data.len() < n {
            return Err(WireError::Truncated {
                needed: n - self.data.len(),
                context,
            });
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    /// Reads a raw byte.
    pub fn raw_u8(&mut self, context: &'static str) -> Result<u8, WireError> {
        Ok(self.take(1, context)?[0])
    }

    /// Reads a raw big-endian u32.
    pub fn raw_u32(&mut self, context: &'static str) -> Result<u32, WireError> {
        let bytes = self.take(4, context)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(word))
    }

    /// Reads a raw big-endian u64.
    pub fn raw_u64(&mut self, context: &'static str) -> Result<u64, WireError> {
        let bytes = self.take(8, context)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(word))
    }

    /// Reads a length-prefixed string.
    pub fn raw_string(&mut self, context: &'static str) -> Result<String, WireError> {
        let len = self.raw_u64(context)? as usize;
        let bytes = self.take(len, context)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadString)
    }

    /// Reads raw UUID bytes.
    pub fn raw_uuid(&mut self, context: &'static str) -> Result<Uuid, WireError> {
        let bytes = self.take(16, context)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(raw))
    }

    /// Reads raw node id bytes.
    pub fn raw_node_id(&mut self, context: &'static str) -> Result<NodeId, WireError> {
        let bytes = self.take(NODE_ID_LEN, context)?;
        let mut raw = [0u8; NODE_ID_LEN];
        raw.copy_from_slice(bytes);
        Ok(NodeId::from_bytes(raw))
    }

    /// Reads raw public key bytes and validates the curve point.
    pub fn raw_public_key(&mut self, context: &'static str) -> Result<VerifyingKey, WireError> {
        let bytes = self.take(32, context)?;
        let mut raw = [0u8; 32];
        raw.copy_from_slice(bytes);
        VerifyingKey::from_bytes(&raw).map_err(|_| WireError::InvalidKey)
    }

    /// Reads raw signature bytes.
    pub fn raw_signature(&mut self, context: &'static str) -> Result<Signature, WireError> {
        let bytes = self.take(64, context)?;
        let mut raw = [0u8; 64];
        raw.copy_from_slice(bytes);
        Ok(Signature::from_bytes(&raw))
    }

    /// Reads a presence flag byte.
    pub fn raw_flag(&mut self, context: &'static str) -> Result<bool, WireError> {
        match self.raw_u8(context)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(WireError::BadEnumByte { context, value }),
        }
    }

    /// Reads a recursively encoded capability tree.
    pub fn raw_tree(&mut self, context: &'static str) -> Result<Tree, WireError> {
        self.raw_tree_depth(context, 0)
    }

    fn raw_tree_depth(&mut self, context: &'static str, depth: usize) -> Result<Tree, WireError> {
        if depth > MAX_TREE_DEPTH {
            return Err(WireError::TreeTooDeep);
        }
        let count = self.raw_u64(context)? as usize;
        // Each entry is at least a tag plus an empty subtree count.
        if count > self.data.len() / 16 {
            return Err(WireError::Truncated {
                needed: count * 16 - self.data.len(),
                context,
            });
        }
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let tag = self.raw_u64(context)?;
            let sub = self.raw_tree_depth(context, depth + 1)?;
            entries.insert(tag, sub);
        }
        Ok(Tree(entries))
    }

    /// Reads a nested marshaled value.
    pub fn raw_value(&mut self, _context: &'static str) -> Result<SerializedValue, WireError> {
        let (value, rest) = SerializedValue::parse(self.data)?;
        self.data = rest;
        Ok(value)
    }

    /// Tagged u8.
    pub fn take_u8(&mut self, context: &'static str) -> Result<u8, WireError> {
        self.expect_tag(TAGS.u8_, context)?;
        self.raw_u8(context)
    }

    /// Tagged u32.
    pub fn take_u32(&mut self, context: &'static str) -> Result<u32, WireError> {
        self.expect_tag(TAGS.u32_, context)?;
        self.raw_u32(context)
    }

    /// Tagged u64.
    pub fn take_u64(&mut self, context: &'static str) -> Result<u64, WireError> {
        self.expect_tag(TAGS.u64_, context)?;
        self.raw_u64(context)
    }

    /// Tagged string.
    pub fn take_string(&mut self, context: &'static str) -> Result<String, WireError> {
        self.expect_tag(TAGS.string, context)?;
        self.raw_string(context)
    }

    /// Tagged UUID.
    pub fn take_uuid(&mut self, context: &'static str) -> Result<Uuid, WireError> {
        self.expect_tag(TAGS.uuid, context)?;
        self.raw_uuid(context)
    }

    /// Tagged node id.
    pub fn take_node_id(&mut self, context: &'static str) -> Result<NodeId, WireError> {
        self.expect_tag(TAGS.node_id, context)?;
        self.raw_node_id(context)
    }

    /// Tagged public key.
    pub fn take_public_key(&mut self, context: &'static str) -> Result<VerifyingKey, WireError> {
        self.expect_tag(TAGS.public_key, context)?;
        self.raw_public_key(context)
    }

    /// Tagged signature.
    pub fn take_signature(&mut self, context: &'static str) -> Result<Signature, WireError> {
        self.expect_tag(TAGS.signature, context)?;
        self.raw_signature(context)
    }

    /// Tagged optional UUID.
    pub fn take_option_uuid(&mut self, context: &'static str) -> Result<Option<Uuid>, WireError> {
        self.expect_tag(TAGS.option, context)?;
        self.expect_tag(TAGS.uuid, context)?;
        if self.raw_flag(context)? {
            Ok(Some(self.raw_uuid(context)?))
        } else {
            Ok(None)
        }
    }

    /// Tagged optional node id.
    pub fn take_option_node_id(
        &mut self,
        context: &'static str,
    ) -> Result<Option<NodeId>, WireError> {
        self.expect_tag(TAGS.option, context)?;
        self.expect_tag(TAGS.node_id, context)?;
        if self.raw_flag(context)? {
            Ok(Some(self.raw_node_id(context)?))
        } else {
            Ok(None)
        }
    }

    /// Tagged string list.
    pub fn take_string_list(&mut self, context: &'static str) -> Result<Vec<String>, WireError> {
        self.expect_tag(TAGS.vec, context)?;
        self.expect_tag(TAGS.string, context)?;
        let count = self.raw_u64(context)? as usize;
        if count > self.data.len() / 8 {
            return Err(WireError::Truncated {
                needed: count * 8 - self.data.len(),
                context,
            });
        }
        let mut items = Vec::new();
        for _ in 0..count {
            items.push(self.raw_string(context)?);
        }
        Ok(items)
    }

    /// Tagged capability tree.
    pub fn take_tree(&mut self, context: &'static str) -> Result<Tree, WireError> {
        self.expect_tag(TAGS.tree, context)?;
        self.raw_tree(context)
    }

    /// Tagged 32-byte signing secret (storage records only).
    pub fn take_secret_key(&mut self, context: &'static str) -> Result<[u8; 32], WireError> {
        self.expect_tag(TAGS.secret_key, context)?;
        let bytes = self.take(32, context)?;
        let mut raw = [0u8; 32];
        raw.copy_from_slice(bytes);
        Ok(raw)
    }

    /// Requires the reader to be fully consumed.
    ///
    /// # Errors
    ///
    /// [`WireError::Trailing`] when shape tags or data bytes remain.
    pub fn finish(self) -> Result<(), WireError> {
        if self.stack.is_empty() && self.data.is_empty() {
            Ok(())
        } else {
            Err(WireError::Trailing {
                types: self.stack.len(),
                bytes: self.data.len(),
            })
        }
    }
}

fn encode_body(signal: &Signal) -> SerializedValue {
    let t = value_tags();
    let mut w = ValueWriter::new();
    w.push_uuid(signal.id);
    w.push_u8(signal.direction.as_u8());
    match &signal.body {
        SignalBody::Create | SignalBody::Start | SignalBody::Stop => {}
        SignalBody::Stopped { req_id, source } => {
            w.push_uuid(*req_id);
            w.push_node_id(*source);
        }
        SignalBody::Status { source, changes } => {
            w.push_node_id(*source);
            w.push_string_list(changes.iter());
        }
        SignalBody::Link { action, node } => {
            w.push_u8(action.as_u8());
            w.push_node_id(*node);
        }
        SignalBody::Lock { action } => {
            w.push_u8(action.as_u8());
        }
        SignalBody::Read { fields } => {
            w.tag(t.map);
            w.tag(t.u64_);
            w.tag(t.vec);
            w.tag(t.string);
            w.raw_u64(fields.len() as u64);
            for (ext, names) in fields {
                w.raw_u64(ext.raw());
                w.raw_u64(names.len() as u64);
                for name in names {
                    w.raw_string(name);
                }
            }
        }
        SignalBody::ReadResult {
            req_id,
            node,
            node_type,
            fields,
        } => {
            w.push_uuid(*req_id);
            w.push_node_id(*node);
            w.push_u64(node_type.raw());
            w.tag(t.map);
            w.tag(t.u64_);
            w.tag(t.map);
            w.tag(t.string);
            w.tag(t.value);
            w.raw_u64(fields.len() as u64);
            for (ext, values) in fields {
                w.raw_u64(ext.raw());
                w.raw_u64(values.len() as u64);
                for (name, value) in values {
                    w.raw_string(name);
                    w.raw_value(value);
                }
            }
        }
        SignalBody::Success { req_id } => {
            w.push_uuid(*req_id);
        }
        SignalBody::Error { req_id, code } => {
            w.push_uuid(*req_id);
            w.push_string(code);
        }
        SignalBody::Acl {
            principal,
            required,
        } => {
            w.push_node_id(*principal);
            w.push_tree(required);
        }
        SignalBody::AddSubGroup { name } => {
            w.push_string(name);
        }
        SignalBody::AddMember { subgroup, member } => {
            w.push_string(subgroup);
            w.push_node_id(*member);
        }
        SignalBody::RemoveMember { member } => {
            w.push_node_id(*member);
        }
        SignalBody::AclTimeout { req_id } | SignalBody::Timeout { req_id } => {
            w.push_uuid(*req_id);
        }
    }
    w.finish()
}

fn decode_body(kind: SignalKind, value: &SerializedValue) -> Result<Signal, WireError> {
    let t = value_tags();
    let mut r = ValueReader::new(value);
    let id = r.take_uuid("signal id")?;
    let direction_byte = r.take_u8("signal direction")?;
    let direction = Direction::from_u8(direction_byte).ok_or(WireError::BadEnumByte {
        context: "signal direction",
        value: direction_byte,
    })?;

    let body = match kind {
        SignalKind::Create => SignalBody::Create,
        SignalKind::Start => SignalBody::Start,
        SignalKind::Stop => SignalBody::Stop,
        SignalKind::Stopped => SignalBody::Stopped {
            req_id: r.take_uuid("stopped req id")?,
            source: r.take_node_id("stopped source")?,
        },
        SignalKind::Status => SignalBody::Status {
            source: r.take_node_id("status source")?,
            changes: r.take_string_list("status changes")?.into_iter().collect(),
        },
        SignalKind::Link => {
            let action_byte = r.take_u8("link action")?;
            SignalBody::Link {
                action: LinkAction::from_u8(action_byte).ok_or(WireError::BadEnumByte {
                    context: "link action",
                    value: action_byte,
                })?,
                node: r.take_node_id("link node")?,
            }
        }
        SignalKind::Lock => {
            let action_byte = r.take_u8("lock action")?;
            SignalBody::Lock {
                action: LockAction::from_u8(action_byte).ok_or(WireError::BadEnumByte {
                    context: "lock action",
                    value: action_byte,
                })?,
            }
        }
        SignalKind::Read => {
            r.expect_tag(t.map, "read fields")?;
            r.expect_tag(t.u64_, "read fields")?;
            r.expect_tag(t.vec, "read fields")?;
            r.expect_tag(t.string, "read fields")?;
            let count = r.raw_u64("read fields")? as usize;
            let mut fields = BTreeMap::new();
            for _ in 0..count {
                let ext = ExtType(r.raw_u64("read ext")?);
                let names_len = r.raw_u64("read field names")? as usize;
                let mut names = Vec::new();
                for _ in 0..names_len {
                    names.push(r.raw_string("read field name")?);
                }
                fields.insert(ext, names);
            }
            SignalBody::Read { fields }
        }
        SignalKind::ReadResult => {
            let req_id = r.take_uuid("read result req id")?;
            let node = r.take_node_id("read result node")?;
            let node_type = NodeType(r.take_u64("read result node type")?);
            r.expect_tag(t.map, "read result fields")?;
            r.expect_tag(t.u64_, "read result fields")?;
            r.expect_tag(t.map, "read result fields")?;
            r.expect_tag(t.string, "read result fields")?;
            r.expect_tag(t.value, "read result fields")?;
            let count = r.raw_u64("read result fields")? as usize;
            let mut fields = BTreeMap::new();
            for _ in 0..count {
                let ext = ExtType(r.raw_u64("read result ext")?);
                let values_len = r.raw_u64("read result values")? as usize;
                let mut values = BTreeMap::new();
                for _ in 0..values_len {
                    let name = r.raw_string("read result field name")?;
                    let value = r.raw_value("read result field value")?;
                    values.insert(name, value);
                }
                fields.insert(ext, values);
            }
            SignalBody::ReadResult {
                req_id,
                node,
                node_type,
                fields,
            }
        }
        SignalKind::Success => SignalBody::Success {
            req_id: r.take_uuid("success req id")?,
        },
        SignalKind::Error => SignalBody::Error {
            req_id: r.take_uuid("error req id")?,
            code: r.take_string("error code")?,
        },
        SignalKind::Acl => SignalBody::Acl {
            principal: r.take_node_id("acl principal")?,
            required: r.take_tree("acl required tree")?,
        },
        SignalKind::AddSubGroup => SignalBody::AddSubGroup {
            name: r.take_string("subgroup name")?,
        },
        SignalKind::AddMember => SignalBody::AddMember {
            subgroup: r.take_string("member subgroup")?,
            member: r.take_node_id("member node")?,
        },
        SignalKind::RemoveMember => SignalBody::RemoveMember {
            member: r.take_node_id("member node")?,
        },
        SignalKind::AclTimeout => SignalBody::AclTimeout {
            req_id: r.take_uuid("acl timeout req id")?,
        },
        SignalKind::Timeout => SignalBody::Timeout {
            req_id: r.take_uuid("timeout req id")?,
        },
    };

    r.finish()?;
    Ok(Signal {
        id,
        direction,
        body,
    })
}

/// Encodes a signal to its canonical bytes.
#[must_use]
pub fn encode_signal(signal: &Signal) -> Vec<u8> {
    let body = encode_body(signal).marshal();
    let mut out = Vec::with_capacity(SIGNAL_HEADER_LEN + body.len());
    out.extend_from_slice(&SIGNAL_MAGIC.to_be_bytes());
    out.extend_from_slice(&signal.kind().signal_type().raw().to_be_bytes());
    out.extend_from_slice(&(body.len() as u64).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decodes a signal from its canonical bytes.
///
/// The input must be exactly one encoded signal: declared length equals the
/// trailing byte count, and the body decoder must consume everything.
///
/// # Errors
///
/// Any [`WireError`] variant describing the first malformation found.
pub fn decode_signal(bytes: &[u8]) -> Result<Signal, WireError> {
    if bytes.len() < SIGNAL_HEADER_LEN {
        return Err(WireError::Truncated {
            needed: SIGNAL_HEADER_LEN - bytes.len(),
            context: "signal envelope",
        });
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[0..4]);
    let magic = u32::from_be_bytes(magic);
    if magic != SIGNAL_MAGIC {
        return Err(WireError::BadMagic { found: magic });
    }

    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[4..12]);
    let type_hash = u64::from_be_bytes(word);
    word.copy_from_slice(&bytes[12..20]);
    let declared = u64::from_be_bytes(word);

    let body = &bytes[SIGNAL_HEADER_LEN..];
    if declared != body.len() as u64 {
        return Err(WireError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }

    let kind = signal_kind_for(type_hash).ok_or(WireError::UnknownSignalType(type_hash))?;
    let (value, rest) = SerializedValue::parse(body)?;
    if !rest.is_empty() {
        return Err(WireError::Trailing {
            types: 0,
            bytes: rest.len(),
        });
    }
    decode_body(kind, &value)
}
