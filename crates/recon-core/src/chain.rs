//! Message chains — one unit of pipeline work.
//!
//! A chain owns an ordered, non-empty list of payloads. The head decides how
//! the rest is read; the common shape is a header record followed by the
//! array it describes. Chains are moved between stages, never shared.

use crate::payload::{Payload, PayloadKind, TypeMismatch, TypedPayload};

#[derive(Debug)]
pub struct MessageChain {
    nodes: Vec<TypedPayload>,
}

impl MessageChain {
    pub fn new(head: TypedPayload) -> Self {
        Self { nodes: vec![head] }
    }

    /// Build the usual two-node chain: header, then data.
    pub fn pair<H: Payload, D: Payload>(header: H, data: D) -> Self {
        Self::new(TypedPayload::new(header)).chain(TypedPayload::new(data))
    }

    /// Append `next` to the tail. No copy.
    pub fn chain(mut self, next: TypedPayload) -> Self {
        self.nodes.push(next);
        self
    }

    pub fn push(&mut self, next: TypedPayload) {
        self.nodes.push(next);
    }

    pub fn head(&self) -> &TypedPayload {
        &self.nodes[0]
    }

    pub fn head_kind(&self) -> PayloadKind {
        self.nodes[0].kind()
    }

    pub fn get(&self, index: usize) -> Option<&TypedPayload> {
        self.nodes.get(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TypedPayload> {
        self.nodes.iter()
    }

    /// Descriptors of every node, head first.
    pub fn kinds(&self) -> Vec<PayloadKind> {
        self.nodes.iter().map(TypedPayload::kind).collect()
    }

    /// Checked access to the value at `index`.
    pub fn unwrap<T: Payload>(&self, index: usize) -> Result<&T, ChainError> {
        let node = self
            .nodes
            .get(index)
            .ok_or(ChainError::MissingNode { index })?;
        node.get::<T>()
            .map_err(|source| ChainError::TypeMismatch { index, source })
    }

    pub fn unwrap_mut<T: Payload>(&mut self, index: usize) -> Result<&mut T, ChainError> {
        let node = self
            .nodes
            .get_mut(index)
            .ok_or(ChainError::MissingNode { index })?;
        node.get_mut::<T>()
            .map_err(|source| ChainError::TypeMismatch { index, source })
    }

    /// Borrow a (header, data) chain as its two typed values.
    pub fn as_pair<H: Payload, D: Payload>(&self) -> Result<(&H, &D), ChainError> {
        Ok((self.unwrap::<H>(0)?, self.unwrap::<D>(1)?))
    }

    /// Take a (header, data) chain apart. The chain must have exactly two
    /// nodes of the requested kinds.
    pub fn into_pair<H: Payload, D: Payload>(self) -> Result<(H, D), ChainError> {
        if self.nodes.len() != 2 {
            return Err(ChainError::UnexpectedLength {
                expected: 2,
                actual: self.nodes.len(),
            });
        }
        // Check both before consuming either.
        self.as_pair::<H, D>()?;

        let mut nodes = self.nodes.into_iter();
        let (Some(head), Some(data)) = (nodes.next(), nodes.next()) else {
            return Err(ChainError::MissingNode { index: 0 });
        };
        let header = head
            .into_inner::<H>()
            .map_err(|source| ChainError::TypeMismatch { index: 0, source })?;
        let data = data
            .into_inner::<D>()
            .map_err(|source| ChainError::TypeMismatch { index: 1, source })?;
        Ok((header, data))
    }
}

impl IntoIterator for MessageChain {
    type Item = TypedPayload;
    type IntoIter = std::vec::IntoIter<TypedPayload>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a MessageChain {
    type Item = &'a TypedPayload;
    type IntoIter = std::slice::Iter<'a, TypedPayload>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

/// A chain did not have the shape its consumer needed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("node {index}: {source}")]
    TypeMismatch { index: usize, source: TypeMismatch },

    #[error("chain has no node at index {index}")]
    MissingNode { index: usize },

    #[error("expected a chain of {expected} nodes, got {actual}")]
    UnexpectedLength { expected: usize, actual: usize },
}
