//! Statements: the opaque logical entities of the knowledge base.
//!
//! The term kernel that gives statements their meaning is external. Here a
//! statement is an identity, a kind, the context it lives in, the statements
//! it logically depends on, and an opaque term encoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminator for the statement's role in the context tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatementKind {
    /// Top-level context; has no containing context.
    RootContext = 0,
    /// Nested context.
    Context = 1,
    Axiom = 2,
    Specialization = 3,
    Declaration = 4,
    Unfolding = 5,
}

impl StatementKind {
    /// Convert to the wire representation.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from the wire representation.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::RootContext),
            1 => Some(Self::Context),
            2 => Some(Self::Axiom),
            3 => Some(Self::Specialization),
            4 => Some(Self::Declaration),
            5 => Some(Self::Unfolding),
            _ => None,
        }
    }

    /// Whether statements of this kind can contain other statements.
    pub const fn is_context(self) -> bool {
        matches!(self, Self::RootContext | Self::Context)
    }
}

/// A logical statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// Stable identity.
    pub uuid: Uuid,
    /// Role in the context tree.
    pub kind: StatementKind,
    /// Containing context. `None` only for root contexts.
    pub context: Option<Uuid>,
    /// Statements this one logically depends on.
    pub dependencies: Vec<Uuid>,
    /// Optional human identifier inside the context.
    pub identifier: Option<String>,
    /// Opaque term encoding owned by the term kernel.
    pub term: Bytes,
}

impl Statement {
    /// Whether this statement is a context (root or nested).
    pub fn is_context(&self) -> bool {
        self.kind.is_context()
    }

    /// Whether this statement is a root context.
    pub fn is_root_context(&self) -> bool {
        self.kind == StatementKind::RootContext
    }

    /// Every statement that must exist before this one can be integrated:
    /// the logical dependencies followed by the containing context.
    pub fn references(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.dependencies.iter().copied().chain(self.context)
    }
}

/// Builder for statements.
#[derive(Debug, Clone)]
pub struct StatementBuilder {
    uuid: Uuid,
    kind: StatementKind,
    context: Option<Uuid>,
    dependencies: Vec<Uuid>,
    identifier: Option<String>,
    term: Bytes,
}

impl StatementBuilder {
    /// Start a statement of the given kind with a fresh uuid.
    pub fn new(kind: StatementKind) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            kind,
            context: None,
            dependencies: Vec::new(),
            identifier: None,
            term: Bytes::new(),
        }
    }

    /// Start a root context.
    pub fn root_context() -> Self {
        Self::new(StatementKind::RootContext)
    }

    /// Use a fixed uuid.
    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    /// Set the containing context.
    pub fn context(mut self, context: Uuid) -> Self {
        self.context = Some(context);
        self
    }

    /// Add a logical dependency.
    pub fn depends_on(mut self, dependency: Uuid) -> Self {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// Set the identifier.
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Set the opaque term.
    pub fn term(mut self, term: impl Into<Bytes>) -> Self {
        self.term = term.into();
        self
    }

    /// Finish the statement.
    pub fn build(self) -> Statement {
        Statement {
            uuid: self.uuid,
            kind: self.kind,
            context: self.context,
            dependencies: self.dependencies,
            identifier: self.identifier,
            term: self.term,
        }
    }
}
