//! A high-level, SSA-form intermediate language for a single function.
//!
//! Expressions are stored in a per-function arena and refer to each other by [`ExprId`]. Every
//! node knows its parent, so a use of a variable can be classified by walking outwards from the
//! use. Statements are the root nodes of the arena, kept in program order.
//!
//! Field dereferences carry an optional [`FieldRef`]: this is information _derived_ by the host
//! from the current types of the variables involved, and it is recomputed whenever the host
//! re-analyzes the function.

use crate::dynamic_variable::dynamic_variable;
use crate::types::Type;

/// A variable of a function (parameter or local), independent of SSA version. Indexes into the
/// function's variable list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableId(pub usize);

/// A specific SSA version of a variable. Version 0 of a parameter is its value on function entry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SsaVariable {
    pub var: VariableId,
    pub version: usize,
}

impl SsaVariable {
    pub fn new(var: usize, version: usize) -> Self {
        Self {
            var: VariableId(var),
            version,
        }
    }
}

impl std::fmt::Debug for SsaVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "v{}#{}", self.var.0, self.version)
    }
}

/// An expression in a [`FunctionIl`] arena
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExprId(usize);

impl ExprId {
    /// Position in the arena. Arena positions are dense, in order of insertion.
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Debug for ExprId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// The struct member a field dereference was resolved to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRef {
    pub struct_name: String,
    pub member: String,
    pub ty: Type,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExprKind {
    /// Read of an SSA variable
    Var(SsaVariable),
    Const(u64),
    /// `&e`
    AddressOf(ExprId),
    /// `*e`
    Deref(ExprId),
    /// `e->field`, i.e., a read of the field at byte `offset` of the struct pointed to by `src`
    DerefField {
        src: ExprId,
        offset: u64,
        field: Option<FieldRef>,
    },
    Call {
        dest: ExprId,
        params: Vec<ExprId>,
    },
    /// Declaration of a new SSA variable with its initial value
    VarInit { dest: SsaVariable, src: ExprId },
    /// Assignment into the variable read at `dest` (always a [`ExprKind::Var`])
    Assign { dest: ExprId, src: ExprId },
    /// Store through memory: `dest` is the location written to (e.g., a [`ExprKind::Deref`])
    AssignMem { dest: ExprId, src: ExprId },
    Return(Vec<ExprId>),
    /// Any operation that this crate does not reason about
    Unhandled { op: String, operands: Vec<ExprId> },
}

impl ExprKind {
    /// The immediate sub-expressions, in order
    pub fn children(&self) -> Vec<ExprId> {
        match self {
            ExprKind::Var(_) | ExprKind::Const(_) => vec![],
            ExprKind::AddressOf(e) | ExprKind::Deref(e) => vec![*e],
            ExprKind::DerefField { src, .. } => vec![*src],
            ExprKind::Call { dest, params } => std::iter::once(*dest)
                .chain(params.iter().cloned())
                .collect(),
            ExprKind::VarInit { src, .. } => vec![*src],
            ExprKind::Assign { dest, src } | ExprKind::AssignMem { dest, src } => {
                vec![*dest, *src]
            }
            ExprKind::Return(es) => es.clone(),
            ExprKind::Unhandled { operands, .. } => operands.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub kind: ExprKind,
    /// The enclosing expression; `None` for statements
    pub parent: Option<ExprId>,
    /// Machine address of the instruction this expression was lifted from
    pub address: u64,
}

/// The IL of one function
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionIl {
    nodes: Vec<Node>,
    statements: Vec<ExprId>,
}

impl FunctionIl {
    pub fn new() -> Self {
        Default::default()
    }

    /// Add a sub-expression. Its children must already be in the arena and must not have a parent
    /// yet; they get `self` as their parent.
    pub fn push(&mut self, kind: ExprKind, address: u64) -> ExprId {
        let id = ExprId(self.nodes.len());
        for c in kind.children() {
            debug_assert!(self.nodes[c.0].parent.is_none(), "Expression reused");
            self.nodes[c.0].parent = Some(id);
        }
        self.nodes.push(Node {
            kind,
            parent: None,
            address,
        });
        id
    }

    /// Add a statement, appended in program order
    pub fn push_statement(&mut self, kind: ExprKind, address: u64) -> ExprId {
        let id = self.push(kind, address);
        self.statements.push(id);
        id
    }

    pub fn node(&self, e: ExprId) -> &Node {
        &self.nodes[e.0]
    }

    pub fn kind(&self, e: ExprId) -> &ExprKind {
        &self.nodes[e.0].kind
    }

    pub fn parent(&self, e: ExprId) -> Option<ExprId> {
        self.nodes[e.0].parent
    }

    /// Mutable access to the node kind. Only derived information may be changed through this;
    /// the tree shape must stay the same.
    pub(crate) fn kind_mut(&mut self, e: ExprId) -> &mut ExprKind {
        &mut self.nodes[e.0].kind
    }

    /// Statements in program order
    pub fn statements(&self) -> impl Iterator<Item = ExprId> + '_ {
        self.statements.iter().cloned()
    }

    /// All expressions in the arena, children before parents
    pub fn exprs(&self) -> impl Iterator<Item = ExprId> {
        (0..self.nodes.len()).map(ExprId)
    }

    /// The SSA variable read by `e`, if `e` is a variable read
    pub fn as_var(&self, e: ExprId) -> Option<SsaVariable> {
        match self.kind(e) {
            ExprKind::Var(v) => Some(*v),
            _ => None,
        }
    }

    /// The constant `e`, if it is one
    pub fn as_const(&self, e: ExprId) -> Option<u64> {
        match self.kind(e) {
            ExprKind::Const(c) => Some(*c),
            _ => None,
        }
    }

    /// If `e` is `*(const addr)`, i.e., a direct access to a global, the address of that global
    pub fn as_global(&self, e: ExprId) -> Option<u64> {
        match self.kind(e) {
            ExprKind::Deref(inner) => self.as_const(*inner),
            _ => None,
        }
    }

    /// A printable view of the expression `e`
    pub fn display(&self, e: ExprId) -> impl std::fmt::Display + '_ {
        DisplayExpr { il: self, e }
    }
}

dynamic_variable!(
    SHOW_DERIVED_FIELDS,
    with_SHOW_DERIVED_FIELDS_set,
    if_SHOW_DERIVED_FIELDS_set
);

struct DisplayExpr<'a> {
    il: &'a FunctionIl,
    e: ExprId,
}

impl<'a> std::fmt::Display for DisplayExpr<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let sub = |e: ExprId| DisplayExpr { il: self.il, e };
        let list = |es: &[ExprId]| {
            es.iter()
                .map(|e| format!(" {}", sub(*e)))
                .collect::<String>()
        };
        match self.il.kind(self.e) {
            ExprKind::Var(v) => write!(f, "(var {} {})", v.var.0, v.version),
            ExprKind::Const(c) => write!(f, "(const {:#x})", c),
            ExprKind::AddressOf(e) => write!(f, "(addr_of {})", sub(*e)),
            ExprKind::Deref(e) => write!(f, "(deref {})", sub(*e)),
            ExprKind::DerefField { src, offset, field } => {
                write!(f, "(field {} {:#x}", sub(*src), offset)?;
                if_SHOW_DERIVED_FIELDS_set(
                    || match field {
                        Some(fr) => write!(f, " /* {}.{}: {} */", fr.struct_name, fr.member, fr.ty),
                        None => Ok(()),
                    },
                    || Ok(()),
                )?;
                write!(f, ")")
            }
            ExprKind::Call { dest, params } => {
                write!(f, "(call {}{})", sub(*dest), list(params.as_slice()))
            }
            ExprKind::VarInit { dest, src } => write!(
                f,
                "(init (var {} {}) {})",
                dest.var.0,
                dest.version,
                sub(*src)
            ),
            ExprKind::Assign { dest, src } => write!(f, "(assign {} {})", sub(*dest), sub(*src)),
            ExprKind::AssignMem { dest, src } => {
                write!(f, "(store {} {})", sub(*dest), sub(*src))
            }
            ExprKind::Return(es) => write!(f, "(ret{})", list(es.as_slice())),
            ExprKind::Unhandled { op, operands } => write!(f, "(op {}{})", op, list(operands.as_slice())),
        }
    }
}
