//! Classification of how a typed SSA variable is used.
//!
//! Propagation only understands a handful of use shapes; everything else is [`UseShape::Unmatched`]
//! and ignored.

use crate::il::{ExprId, ExprKind, FieldRef, FunctionIl, SsaVariable};

/// What consumes the value read from a struct field
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldConsumer {
    /// Declaration of, or plain assignment to, a local variable
    Local(SsaVariable),
    /// A store to the global at the given address
    Global(u64),
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UseShape {
    /// Passed as the `index`th argument of a direct call to `target`
    CallArgument {
        call: ExprId,
        target: u64,
        index: usize,
    },
    /// Stored directly to the global at `address`: `*(const address) = v`
    GlobalStore { address: u64 },
    /// Dereferenced to read a struct field, whose value flows into `consumer`
    FieldDeref {
        deref: ExprId,
        field: FieldRef,
        consumer: FieldConsumer,
    },
    Unmatched,
}

/// Classify the variable read `use_` by the shape of the expressions enclosing it
pub fn classify(il: &FunctionIl, use_: ExprId) -> UseShape {
    let parent = match il.parent(use_) {
        Some(p) => p,
        None => return UseShape::Unmatched,
    };
    match il.kind(parent) {
        ExprKind::Call { dest, params } => {
            match (
                il.as_const(*dest),
                params.iter().position(|p| *p == use_),
            ) {
                (Some(target), Some(index)) => UseShape::CallArgument {
                    call: parent,
                    target,
                    index,
                },
                _ => UseShape::Unmatched,
            }
        }
        ExprKind::AssignMem { dest, src } if *src == use_ => match il.as_global(*dest) {
            Some(address) => UseShape::GlobalStore { address },
            None => UseShape::Unmatched,
        },
        ExprKind::DerefField {
            src,
            field: Some(field),
            ..
        } if *src == use_ => UseShape::FieldDeref {
            deref: parent,
            field: field.clone(),
            consumer: consumer_of(il, parent),
        },
        _ => UseShape::Unmatched,
    }
}

fn consumer_of(il: &FunctionIl, value: ExprId) -> FieldConsumer {
    let parent = match il.parent(value) {
        Some(p) => p,
        None => return FieldConsumer::Other,
    };
    match il.kind(parent) {
        ExprKind::VarInit { dest, src } if *src == value => FieldConsumer::Local(*dest),
        ExprKind::Assign { dest, src } if *src == value => match il.as_var(*dest) {
            Some(v) => FieldConsumer::Local(v),
            None => FieldConsumer::Other,
        },
        ExprKind::AssignMem { dest, src } if *src == value => match il.as_global(*dest) {
            Some(address) => FieldConsumer::Global(address),
            None => FieldConsumer::Other,
        },
        _ => FieldConsumer::Other,
    }
}
