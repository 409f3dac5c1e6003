//! An in-memory analysis database: an [`AnalysisHost`] over a binary that has been exported from a
//! disassembler (see [`crate::exported_lifter`]).
//!
//! Derived IL information (which struct member a field dereference reads) is computed from the
//! variable, data, and type definitions at the time a function is analyzed, and is only refreshed
//! by [`AnalysisHost::reanalyze`].

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::host::{AnalysisHost, FunctionId, Segment, VariableInfo};
use crate::il::{ExprId, ExprKind, FieldRef, FunctionIl, VariableId};
use crate::log::*;
use crate::ssa::SSA;
use crate::types::{Type, TypeDefinition};

/// A function and everything the database knows about it
pub struct FunctionRecord {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub return_type: Type,
    /// Parameters and locals, indexed by [`VariableId`]
    pub variables: Vec<VariableInfo>,
    ssa: Rc<SSA>,
    stale: bool,
}

impl FunctionRecord {
    /// The IL as of the last analysis
    pub fn il(&self) -> &Rc<FunctionIl> {
        &self.ssa.il
    }
}

pub struct AnalysisDatabase {
    /// Name of the exported program
    pub name: String,
    platform: String,
    pointer_size: usize,
    entry: Option<u64>,
    /// Definitions in order of definition; redefinitions replace in place
    types: Vec<(String, TypeDefinition)>,
    segments: Vec<(Segment, Vec<u8>)>,
    symbols: BTreeMap<u64, String>,
    data_variables: BTreeMap<u64, Type>,
    functions: Vec<FunctionRecord>,
}

impl AnalysisDatabase {
    pub fn new(name: &str, platform: &str, pointer_size: usize) -> Self {
        Self {
            name: name.to_owned(),
            platform: platform.to_owned(),
            pointer_size,
            entry: None,
            types: vec![],
            segments: vec![],
            symbols: Default::default(),
            data_variables: Default::default(),
            functions: vec![],
        }
    }

    /// Map `bytes` at `start`. Fails if they would run past the end of the address space.
    pub fn add_segment(
        &mut self,
        start: u64,
        bytes: Vec<u8>,
        permissions: &str,
    ) -> std::result::Result<(), String> {
        let end = u64::try_from(bytes.len())
            .ok()
            .and_then(|len| start.checked_add(len))
            .ok_or_else(|| format!("segment at {:#x} overflows the address space", start))?;
        let segment = Segment {
            start,
            end,
            readable: permissions.contains('r'),
            writable: permissions.contains('w'),
            executable: permissions.contains('x'),
        };
        self.segments.push((segment, bytes));
        Ok(())
    }

    pub fn set_entry(&mut self, address: u64) {
        self.entry = Some(address);
    }

    pub fn entry_address(&self) -> Option<u64> {
        self.entry
    }

    /// Add a function covering `[start, end)`, and analyze it
    pub fn add_function(
        &mut self,
        name: &str,
        (start, end): (u64, u64),
        return_type: Type,
        variables: Vec<VariableInfo>,
        il: FunctionIl,
    ) -> FunctionId {
        let f = FunctionId(self.functions.len());
        let il = Rc::new(il);
        self.functions.push(FunctionRecord {
            name: name.to_owned(),
            start,
            end,
            return_type,
            variables,
            ssa: SSA::compute_from(&il),
            stale: true,
        });
        self.reanalyze(f);
        f
    }

    pub fn function_record(&self, f: FunctionId) -> &FunctionRecord {
        &self.functions[f.0]
    }

    pub fn function_records(&self) -> impl Iterator<Item = &FunctionRecord> {
        self.functions.iter()
    }

    pub fn types(&self) -> impl Iterator<Item = (&str, &TypeDefinition)> {
        self.types.iter().map(|(n, d)| (n.as_str(), d))
    }

    /// Segments along with their contents
    pub fn segment_contents(&self) -> impl Iterator<Item = (&Segment, &[u8])> {
        self.segments.iter().map(|(s, b)| (s, b.as_slice()))
    }

    pub fn symbols(&self) -> impl Iterator<Item = (u64, &str)> {
        self.symbols.iter().map(|(a, n)| (*a, n.as_str()))
    }

    pub fn data_variables(&self) -> impl Iterator<Item = (u64, &Type)> {
        self.data_variables.iter().map(|(a, t)| (*a, t))
    }

    /// Find the function named `name`
    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|r| r.name == name)
            .map(FunctionId)
    }

    fn invalidate_all(&mut self) {
        for r in self.functions.iter_mut() {
            r.stale = true;
        }
    }

    /// Compute the IL of `f` with field dereferences resolved against the current types
    fn derive_fields(&self, f: FunctionId) -> FunctionIl {
        let rec = &self.functions[f.0];
        let mut il: FunctionIl = (**rec.il()).clone();
        // Exprs are visited children-first, so sub-expression types are always available
        let mut tys: Vec<Type> = vec![];
        for e in il.exprs().collect::<Vec<_>>() {
            let ty_of = |e: ExprId, tys: &[Type]| tys[e.index()].clone();
            let ty = match il.kind(e).clone() {
                ExprKind::Var(v) => rec
                    .variables
                    .get(v.var.0)
                    .map_or(Type::Unknown, |vi| vi.ty.clone()),
                ExprKind::AddressOf(x) => match ty_of(x, &tys) {
                    Type::Unknown => Type::Unknown,
                    t => t.pointer(),
                },
                ExprKind::Deref(x) => match il.as_const(x) {
                    Some(a) => self
                        .data_variables
                        .get(&a)
                        .cloned()
                        .unwrap_or(Type::Unknown),
                    None => ty_of(x, &tys)
                        .pointee()
                        .cloned()
                        .unwrap_or(Type::Unknown),
                },
                ExprKind::DerefField { src, offset, .. } => {
                    let field = self.pointee_struct(&ty_of(src, &tys)).and_then(
                        |(struct_name, def)| {
                            def.field_at(offset).map(|fld| FieldRef {
                                struct_name,
                                member: fld.name.clone(),
                                ty: fld.ty.clone(),
                            })
                        },
                    );
                    let ty = field.as_ref().map_or(Type::Unknown, |f| f.ty.clone());
                    if let ExprKind::DerefField { field: derived, .. } = il.kind_mut(e) {
                        *derived = field;
                    }
                    ty
                }
                _ => Type::Unknown,
            };
            tys.push(ty);
        }
        il
    }
}

impl AnalysisHost for AnalysisDatabase {
    fn platform(&self) -> String {
        self.platform.clone()
    }

    fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    fn segments(&self) -> Vec<Segment> {
        self.segments.iter().map(|(s, _)| *s).collect()
    }

    fn read(&self, address: u64, len: usize) -> Vec<u8> {
        self.segments
            .iter()
            .find(|(s, _)| s.start <= address && address < s.end)
            .map(|(s, bytes)| {
                let off = (address - s.start) as usize;
                bytes[off..bytes.len().min(off + len)].to_vec()
            })
            .unwrap_or_default()
    }

    fn functions(&self) -> Vec<FunctionId> {
        (0..self.functions.len()).map(FunctionId).collect()
    }

    fn entry_function(&self) -> Option<FunctionId> {
        self.function_at(self.entry?)
    }

    fn function_at(&self, address: u64) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|r| r.start == address)
            .map(FunctionId)
    }

    fn functions_containing(&self, address: u64) -> Vec<FunctionId> {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.start <= address && address < r.end)
            .map(|(i, _)| FunctionId(i))
            .collect()
    }

    fn function_name(&self, f: FunctionId) -> String {
        self.functions[f.0].name.clone()
    }

    fn set_function_name(&mut self, f: FunctionId, name: &str) {
        self.functions[f.0].name = name.to_owned();
    }

    fn set_return_type(&mut self, f: FunctionId, ty: Type) {
        let rec = &mut self.functions[f.0];
        if rec.return_type != ty {
            rec.return_type = ty;
            rec.stale = true;
        }
    }

    fn parameters(&self, f: FunctionId) -> Vec<VariableId> {
        self.functions[f.0]
            .variables
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_parameter)
            .map(|(i, _)| VariableId(i))
            .collect()
    }

    fn variable(&self, f: FunctionId, v: VariableId) -> Option<VariableInfo> {
        self.functions[f.0].variables.get(v.0).cloned()
    }

    fn set_variable(&mut self, f: FunctionId, v: VariableId, name: &str, ty: Type) {
        let rec = &mut self.functions[f.0];
        match rec.variables.get_mut(v.0) {
            Some(var) => {
                var.name = name.to_owned();
                var.ty = ty;
                rec.stale = true;
            }
            None => {
                warn!("Attempted to set unknown variable"; "function" => &rec.name, "var" => v.0);
            }
        }
    }

    fn set_parameter(&mut self, f: FunctionId, index: usize, name: &str, ty: Type) -> VariableId {
        let mut params = self.parameters(f);
        let rec = &mut self.functions[f.0];
        while params.len() <= index {
            trace!("Extending signature"; "function" => &rec.name, "param" => params.len());
            params.push(VariableId(rec.variables.len()));
            rec.variables.push(VariableInfo {
                name: format!("arg{}", params.len()),
                ty: Type::Unknown,
                is_parameter: true,
            });
        }
        let v = params[index];
        self.set_variable(f, v, name, ty);
        v
    }

    fn needs_reanalysis(&self, f: FunctionId) -> bool {
        self.functions[f.0].stale
    }

    fn reanalyze(&mut self, f: FunctionId) {
        let il = Rc::new(self.derive_fields(f));
        let rec = &mut self.functions[f.0];
        trace!("Reanalyzed function"; "function" => &rec.name);
        rec.ssa = SSA::compute_from(&il);
        rec.stale = false;
    }

    fn ssa(&self, f: FunctionId) -> Rc<SSA> {
        self.functions[f.0].ssa.clone()
    }

    fn data_variable_at(&self, address: u64) -> Option<Type> {
        self.data_variables.get(&address).cloned()
    }

    fn define_data_variable(&mut self, address: u64, ty: Type) {
        if self.data_variables.get(&address) != Some(&ty) {
            self.data_variables.insert(address, ty);
            self.invalidate_all();
        }
    }

    fn define_data_symbol(&mut self, address: u64, name: &str) {
        self.symbols.insert(address, name.to_owned());
    }

    fn symbol_at(&self, address: u64) -> Option<String> {
        self.symbols.get(&address).cloned()
    }

    fn symbol_by_name(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(a, _)| *a)
    }

    fn lookup_type(&self, name: &str) -> Option<TypeDefinition> {
        let name = name.trim_start_matches('_');
        self.types
            .iter()
            .find(|(n, _)| n.trim_start_matches('_') == name)
            .map(|(_, d)| d.clone())
    }

    fn define_type(&mut self, name: &str, def: TypeDefinition) {
        match self.types.iter_mut().find(|(n, _)| n == name) {
            Some((_, d)) if *d == def => return,
            Some((_, d)) => *d = def,
            None => self.types.push((name.to_owned(), def)),
        }
        self.invalidate_all();
    }
}
