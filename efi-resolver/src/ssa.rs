//! Def-use index over a function's SSA-form [`il::FunctionIl`](crate::il::FunctionIl).
//!
//! The IL is already in SSA form (every [`SsaVariable`] has at most one definition), so this just
//! indexes it: which expression defines each SSA variable, and which expressions read it.

use std::rc::Rc;

use crate::containers::unordered::UnorderedMap;
use crate::il::{ExprId, ExprKind, FunctionIl, SsaVariable, VariableId};
use crate::log::*;

/// How an [`SsaVariable`] gets its value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Definition {
    /// Declared by the [`ExprKind::VarInit`] statement at the given expression
    Init(ExprId),
    /// Assigned by the [`ExprKind::Assign`] statement at the given expression
    Assign(ExprId),
}

impl Definition {
    /// The defining statement
    pub fn statement(self) -> ExprId {
        match self {
            Definition::Init(e) | Definition::Assign(e) => e,
        }
    }
}

/// The def-use index of a snapshot of one function's IL
pub struct SSA {
    pub il: Rc<FunctionIl>,
    uses: UnorderedMap<SsaVariable, Vec<ExprId>>,
    defs: UnorderedMap<SsaVariable, Definition>,
}

impl SSA {
    /// Index the given IL
    pub fn compute_from(il: &Rc<FunctionIl>) -> Rc<Self> {
        let mut uses: UnorderedMap<SsaVariable, Vec<ExprId>> = Default::default();
        let mut defs: UnorderedMap<SsaVariable, Definition> = Default::default();

        for e in il.exprs() {
            match il.kind(e) {
                ExprKind::VarInit { dest, .. } => {
                    if defs.insert(*dest, Definition::Init(e)).is_some() {
                        debug!("SSA variable defined more than once"; "var" => ?dest);
                    }
                }
                ExprKind::Assign { dest, .. } => {
                    if let Some(v) = il.as_var(*dest) {
                        if defs.insert(v, Definition::Assign(e)).is_some() {
                            debug!("SSA variable defined more than once"; "var" => ?v);
                        }
                    }
                }
                ExprKind::Var(v) => {
                    let is_assign_dest = il.parent(e).map_or(false, |p| {
                        matches!(il.kind(p), ExprKind::Assign { dest, .. } if *dest == e)
                    });
                    if !is_assign_dest {
                        uses.entry(*v).or_default().push(e);
                    }
                }
                _ => {}
            }
        }

        Rc::new(Self {
            il: il.clone(),
            uses,
            defs,
        })
    }

    /// The expressions reading `v`, in arena order
    pub fn uses_of(&self, v: SsaVariable) -> &[ExprId] {
        self.uses.get(&v).map(|u| u.as_slice()).unwrap_or(&[])
    }

    /// The expressions reading any SSA version of `var`
    pub fn uses_of_variable(&self, var: VariableId) -> impl Iterator<Item = ExprId> + '_ {
        self.uses
            .iter()
            .filter(move |(v, _)| v.var == var)
            .flat_map(|(_, u)| u.iter().cloned())
    }

    /// The definition of `v`. `None` for values flowing in from outside the function (e.g.,
    /// version 0 of a parameter).
    pub fn definition_of(&self, v: SsaVariable) -> Option<Definition> {
        self.defs.get(&v).cloned()
    }

    /// The value assigned by the definition of `v`
    pub fn defining_value(&self, v: SsaVariable) -> Option<ExprId> {
        match self.il.kind(self.definition_of(v)?.statement()) {
            ExprKind::VarInit { src, .. } | ExprKind::Assign { src, .. } => Some(*src),
            _ => None,
        }
    }
}
