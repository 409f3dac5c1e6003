//! The interface to the program analysis host that owns the binary under analysis.
//!
//! The host does disassembly, lifting, and SSA construction, and is the durable store of every
//! name and type that resolution assigns. Everything in this crate goes through
//! [`AnalysisHost`]; [`crate::database::AnalysisDatabase`] is the in-memory implementation.

use std::rc::Rc;

use crate::il::VariableId;
use crate::ssa::SSA;
use crate::types::{Type, TypeDefinition};

/// A function known to the host
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionId(pub usize);

/// A mapped range `[start, end)` of the binary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

/// Name and type of a parameter or local variable
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub ty: Type,
    pub is_parameter: bool,
}

pub trait AnalysisHost {
    /// Name of the platform the binary was loaded for, e.g. `efi-x86_64`
    fn platform(&self) -> String;
    fn pointer_size(&self) -> usize;

    fn segments(&self) -> Vec<Segment>;
    /// Read up to `len` bytes at `address`. Fewer bytes are returned if the read runs past the
    /// end of mapped memory.
    fn read(&self, address: u64, len: usize) -> Vec<u8>;

    fn functions(&self) -> Vec<FunctionId>;
    fn entry_function(&self) -> Option<FunctionId>;
    /// The function that starts exactly at `address`
    fn function_at(&self, address: u64) -> Option<FunctionId>;
    fn functions_containing(&self, address: u64) -> Vec<FunctionId>;

    fn function_name(&self, f: FunctionId) -> String;
    fn set_function_name(&mut self, f: FunctionId, name: &str);
    fn set_return_type(&mut self, f: FunctionId, ty: Type);
    /// Parameters, in order
    fn parameters(&self, f: FunctionId) -> Vec<VariableId>;
    fn variable(&self, f: FunctionId, v: VariableId) -> Option<VariableInfo>;
    /// Rename and retype the local or parameter `v`
    fn set_variable(&mut self, f: FunctionId, v: VariableId, name: &str, ty: Type);
    /// Rename and retype the `index`th parameter of `f`, extending the signature if `f` does
    /// not have that many parameters yet.
    fn set_parameter(&mut self, f: FunctionId, index: usize, name: &str, ty: Type) -> VariableId;

    /// Whether names or types that `f`'s derived IL information depends on have changed since its
    /// last analysis.
    fn needs_reanalysis(&self, f: FunctionId) -> bool;
    /// Recompute derived information of `f` from its current signature and variable types.
    /// Blocks until done; later calls to [`Self::ssa`] see the result.
    fn reanalyze(&mut self, f: FunctionId);
    /// The current IL snapshot of `f`, with its def-use index
    fn ssa(&self, f: FunctionId) -> Rc<SSA>;

    /// Type of the data variable at `address`, if one is defined
    fn data_variable_at(&self, address: u64) -> Option<Type>;
    fn define_data_variable(&mut self, address: u64, ty: Type);
    fn define_data_symbol(&mut self, address: u64, name: &str);
    fn symbol_at(&self, address: u64) -> Option<String>;
    /// The address of the data symbol named exactly `name`
    fn symbol_by_name(&self, name: &str) -> Option<u64>;

    fn lookup_type(&self, name: &str) -> Option<TypeDefinition>;
    fn define_type(&mut self, name: &str, def: TypeDefinition);

    /// Convenience: the struct definition that a single-level pointer type points to
    fn pointee_struct(&self, ty: &Type) -> Option<(String, TypeDefinition)> {
        let mut name = match ty.pointer_to_named()? {
            (1, name) => name.to_owned(),
            _ => return None,
        };
        // Follow typedefs to the underlying struct
        for _ in 0..8 {
            match self.lookup_type(&name)? {
                TypeDefinition::Alias(Type::Named(n)) => name = n.trim_start_matches('_').into(),
                def @ TypeDefinition::Struct { .. } => return Some((name, def)),
                TypeDefinition::Alias(_) => return None,
            }
        }
        None
    }
}
