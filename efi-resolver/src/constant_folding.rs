//! Lazily computed constant folding of address arguments. Results are memoized per expression, so
//! repeated queries against the same snapshot are cheap.

use std::cell::Cell;
use std::rc::Rc;

use crate::il::{ExprId, ExprKind};
use crate::log::*;
use crate::resolver_config::CONFIG;
use crate::ssa::SSA;

/// Memoized folding state of one expression
#[derive(Clone, Copy)]
enum Value {
    Unknown,
    SentinelForRecursion,
    Dynamic,
    Constant(u64),
}

/// Constant folding over one function snapshot
pub struct ConstFolded {
    known_constants: Vec<Cell<Value>>,
    ssa: Rc<SSA>,
}

impl ConstFolded {
    /// Nothing is folded until asked for
    pub fn from_ssa(ssa: &Rc<SSA>) -> Rc<Self> {
        Rc::new(Self {
            known_constants: ssa.il.exprs().map(|_| Cell::new(Value::Unknown)).collect(),
            ssa: ssa.clone(),
        })
    }

    /// The compile-time constant address that `e` evaluates to, if any. Recognizes literal
    /// constants, the address of a global, and (if enabled) variables whose single SSA definition
    /// is a chain of copies ending in one of those.
    pub fn address_of(&self, e: ExprId) -> Option<u64> {
        let cell = &self.known_constants[e.index()];
        // Cycles through copies fold to nothing
        match cell.get() {
            Value::Unknown => cell.set(Value::SentinelForRecursion),
            Value::SentinelForRecursion => {
                trace!("Cyclic definition while constant folding"; "expr" => ?e);
                cell.set(Value::Dynamic);
                return None;
            }
            Value::Dynamic => return None,
            Value::Constant(c) => return Some(c),
        }

        let il = &self.ssa.il;
        let res = match il.kind(e) {
            ExprKind::Const(c) => Some(*c),
            ExprKind::AddressOf(inner) => match il.kind(*inner) {
                ExprKind::Const(c) => Some(*c),
                _ => il.as_global(*inner),
            },
            ExprKind::Var(v) if CONFIG.fold_guid_arguments_through_copies => self
                .ssa
                .defining_value(*v)
                .and_then(|src| self.address_of(src)),
            _ => None,
        };

        cell.set(match res {
            Some(c) => Value::Constant(c),
            None => Value::Dynamic,
        });
        res
    }
}
