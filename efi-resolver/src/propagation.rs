//! Interprocedural propagation of typed interface pointers.
//!
//! Starting from functions whose parameters are pointers to tracked structs (or from individual
//! typed locals), every use of such a value is classified (see [`crate::classify`]):
//!
//! - passing it to a known function types the callee's corresponding parameter, and queues the
//!   callee for examination;
//! - storing it directly to a global types the global;
//! - reading a field that is itself a pointer to a tracked struct types the local or global the
//!   field's value is written to, and the uses of such a local are followed in turn.
//!
//! Facts only ever grow: a location that already holds a tracked pointer type is never retyped to
//! something else, so the work queue eventually drains.

use itertools::Itertools;

use crate::classify::{classify, FieldConsumer, UseShape};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::containers::WorkQueue;
use crate::host::{AnalysisHost, FunctionId};
use crate::il::{SsaVariable, VariableId};
use crate::log::*;
use crate::pipeline::{Cancellation, PassStatus};
use crate::registry::Registry;
use crate::resolver_config::CONFIG;
use crate::trace::{Location, Trace};
use crate::types::Type;

/// Structs whose pointers are always tracked
pub const ROOT_STRUCTS: [&str; 3] = [
    "EFI_SYSTEM_TABLE",
    "EFI_BOOT_SERVICES",
    "EFI_RUNTIME_SERVICES",
];

/// Globals that get typed by name, regardless of whether propagation reaches them
pub const WELL_KNOWN_GLOBALS: [(&str, &str); 5] = [
    ("EfiST", "EFI_SYSTEM_TABLE"),
    ("EfiBS", "EFI_BOOT_SERVICES"),
    ("EfiRT", "EFI_RUNTIME_SERVICES"),
    ("EfiConOut", "EFI_SIMPLE_TEXT_OUTPUT_PROTOCOL"),
    ("EfiConIn", "EFI_SIMPLE_TEXT_INPUT_PROTOCOL"),
];

/// The struct types whose pointers are propagated, along with the name given to variables of
/// that type.
pub struct TrackedTypes {
    canonical: UnorderedMap<String, String>,
}

impl TrackedTypes {
    /// The root tables, and every protocol struct designated by a binding in `registry`
    pub fn new(registry: &Registry) -> Self {
        let canonical = ROOT_STRUCTS
            .iter()
            .map(|s| s.to_string())
            .chain(registry.bindings().map(|b| b.struct_name.clone()))
            .map(|s| {
                let s = s.trim_start_matches('_').to_owned();
                let name = canonical_name_for(&s);
                (s, name)
            })
            .collect();
        Self { canonical }
    }

    /// If `ty` is a pointer (or pointer-to-pointer) to a tracked struct, the name to give to
    /// values of that type
    pub fn canonical_name(&self, ty: &Type) -> Option<&str> {
        match ty.pointer_to_named()? {
            (1..=2, name) => self.canonical.get(name).map(|s| s.as_str()),
            _ => None,
        }
    }

    pub fn is_tracked(&self, ty: &Type) -> bool {
        self.canonical_name(ty).is_some()
    }
}

/// `EFI_LOADED_IMAGE_PROTOCOL` -> `LoadedImageProtocol`
pub fn canonical_name_for(struct_name: &str) -> String {
    let s = struct_name.trim_start_matches('_');
    let s = s.strip_prefix("EFI_").unwrap_or(s);
    s.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut cs = w.chars();
            match cs.next() {
                Some(c) => c
                    .to_uppercase()
                    .chain(cs.flat_map(|c| c.to_lowercase()))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Applies tracked types to locations in the host, refusing to replace a tracked type with a
/// different one.
pub(crate) struct TypeWriter<'a, H: AnalysisHost + ?Sized> {
    pub host: &'a mut H,
    pub tracked: &'a TrackedTypes,
    pub trace: &'a mut Trace,
    /// Number of locations whose type was changed
    pub changes: usize,
}

impl<'a, H: AnalysisHost + ?Sized> TypeWriter<'a, H> {
    pub fn new(host: &'a mut H, tracked: &'a TrackedTypes, trace: &'a mut Trace) -> Self {
        Self {
            host,
            tracked,
            trace,
            changes: 0,
        }
    }

    /// The name to give a location of type `ty`, or `None` if `ty` must not be written over
    /// `current`
    fn admissible(&self, current: Option<&Type>, ty: &Type) -> Option<String> {
        let name = self.tracked.canonical_name(ty)?.to_owned();
        match current {
            Some(cur) if cur == ty => None,
            Some(cur) if self.tracked.is_tracked(cur) => {
                debug!("Keeping existing tracked type"; "existing" => %cur, "proposed" => %ty);
                None
            }
            _ => Some(name),
        }
    }

    pub fn variable_location(&self, f: FunctionId, v: VariableId) -> Location {
        Location::Variable {
            function: self.host.function_name(f),
            variable: self
                .host
                .variable(f, v)
                .map(|vi| vi.name)
                .unwrap_or_else(|| format!("var{}", v.0)),
        }
    }

    pub fn global_location(&self, address: u64) -> Location {
        Location::Global {
            address,
            name: self.host.symbol_at(address),
        }
    }

    /// Type the local or parameter `v` of `f`. Returns whether anything changed.
    pub fn variable(
        &mut self,
        f: FunctionId,
        v: VariableId,
        ty: &Type,
        from: Option<Location>,
        cause: &'static str,
    ) -> bool {
        let current = self.host.variable(f, v).map(|vi| vi.ty);
        let name = match self.admissible(current.as_ref(), ty) {
            Some(n) => n,
            None => return false,
        };
        info!("Typing variable";
              "function" => self.host.function_name(f),
              "name" => &name,
              "type" => %ty,
              "cause" => cause);
        self.host.set_variable(f, v, &name, ty.clone());
        self.changes += 1;
        let to = self.variable_location(f, v);
        self.trace.record(from, to, ty, cause);
        true
    }

    /// Type the `index`th parameter of `f`. Returns whether anything changed.
    pub fn parameter(
        &mut self,
        f: FunctionId,
        index: usize,
        ty: &Type,
        from: Option<Location>,
        cause: &'static str,
    ) -> bool {
        let current = match self.host.parameters(f).get(index) {
            Some(p) => self.host.variable(f, *p).map(|vi| vi.ty),
            None => None,
        };
        let name = match self.admissible(current.as_ref(), ty) {
            Some(n) => n,
            None => return false,
        };
        info!("Typing parameter";
              "function" => self.host.function_name(f),
              "index" => index,
              "name" => &name,
              "type" => %ty,
              "cause" => cause);
        let v = self.host.set_parameter(f, index, &name, ty.clone());
        self.changes += 1;
        let to = self.variable_location(f, v);
        self.trace.record(from, to, ty, cause);
        true
    }

    /// Type the global at `address`, naming it unless it is already named. Returns whether
    /// anything changed.
    pub fn global(
        &mut self,
        address: u64,
        ty: &Type,
        from: Option<Location>,
        cause: &'static str,
    ) -> bool {
        let current = self.host.data_variable_at(address);
        let name = match self.admissible(current.as_ref(), ty) {
            Some(n) => n,
            None => return false,
        };
        let existing = self.host.symbol_at(address);
        info!("Typing global";
              "address" => format!("{:#x}", address),
              OptionalKV("symbol", existing.clone()),
              "type" => %ty,
              "cause" => cause);
        self.host.define_data_variable(address, ty.clone());
        if existing.is_none() {
            self.host.define_data_symbol(address, &name);
        }
        self.changes += 1;
        let to = self.global_location(address);
        self.trace.record(from, to, ty, cause);
        true
    }
}

/// A starting point for propagation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Seed {
    /// Examine the function's parameters
    Function(FunctionId),
    /// Follow the uses of every SSA version of a local of a function
    Local { function: FunctionId, var: VariableId },
}

/// Result of a propagation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropagationOutcome {
    pub status: PassStatus,
    /// Number of locations whose type was changed
    pub changes: usize,
}

struct Propagator<'a, H: AnalysisHost + ?Sized, C: Cancellation + ?Sized> {
    writer: TypeWriter<'a, H>,
    cancel: &'a C,
    queue: WorkQueue<FunctionId>,
    visited_functions: UnorderedSet<FunctionId>,
    visited_locations: UnorderedSet<(FunctionId, SsaVariable)>,
}

/// Run a propagation pass from `seeds` until no more typed values are discovered, or until
/// cancelled. Changes made before cancellation stay in place.
pub fn propagate<H: AnalysisHost + ?Sized, C: Cancellation + ?Sized>(
    host: &mut H,
    tracked: &TrackedTypes,
    seeds: impl IntoIterator<Item = Seed>,
    cancel: &C,
    trace: &mut Trace,
) -> PropagationOutcome {
    let mut p = Propagator {
        writer: TypeWriter::new(host, tracked, trace),
        cancel,
        queue: WorkQueue::new(),
        visited_functions: UnorderedSet::new(),
        visited_locations: UnorderedSet::new(),
    };
    let status = p.run(seeds);
    let changes = p.writer.changes;
    debug!("Propagation pass done"; "status" => ?status, "changes" => changes);
    PropagationOutcome { status, changes }
}

impl<'a, H: AnalysisHost + ?Sized, C: Cancellation + ?Sized> Propagator<'a, H, C> {
    fn run(&mut self, seeds: impl IntoIterator<Item = Seed>) -> PassStatus {
        let mut locals = vec![];
        for seed in seeds {
            match seed {
                Seed::Function(f) => {
                    self.queue.push(f);
                }
                Seed::Local { function, var } => locals.push((function, var)),
            }
        }

        for (f, var) in locals {
            if self.cancel.is_cancelled() {
                return PassStatus::Cancelled;
            }
            self.refresh(f);
            let ty = match self.writer.host.variable(f, var) {
                Some(vi) if self.writer.tracked.is_tracked(&vi.ty) => vi.ty,
                _ => {
                    trace!("Seed is not of a tracked type"; "var" => ?var);
                    continue;
                }
            };
            let ssa = self.writer.host.ssa(f);
            let versions: Vec<SsaVariable> = ssa
                .uses_of_variable(var)
                .filter_map(|e| ssa.il.as_var(e))
                .unique()
                .collect();
            for v in versions {
                self.propagate_variable(f, v, &ty);
            }
        }

        while let Some(f) = self.queue.pop() {
            if self.cancel.is_cancelled() {
                return PassStatus::Cancelled;
            }
            self.visit_function(f);
        }

        if CONFIG.enable_well_known_globals {
            self.type_well_known_globals();
        }
        PassStatus::Completed
    }

    /// Commit-and-refresh: make sure derived information of `f` reflects its current types
    fn refresh(&mut self, f: FunctionId) {
        if self.writer.host.needs_reanalysis(f) {
            self.writer.host.reanalyze(f);
        }
    }

    fn visit_function(&mut self, f: FunctionId) {
        trace!("Visiting function"; "function" => self.writer.host.function_name(f));
        self.visited_functions.insert(f);
        self.refresh(f);
        for p in self.writer.host.parameters(f) {
            let ty = match self.writer.host.variable(f, p) {
                Some(vi) if self.writer.tracked.is_tracked(&vi.ty) => vi.ty,
                _ => continue,
            };
            self.propagate_variable(f, SsaVariable { var: p, version: 0 }, &ty);
        }
    }

    fn propagate_variable(&mut self, f: FunctionId, var: SsaVariable, ty: &Type) {
        if !self.visited_locations.insert((f, var)) {
            return;
        }
        let uses = self.writer.host.ssa(f).uses_of(var).to_vec();
        for u in uses {
            // Derived information may have been refreshed while handling an earlier use
            let ssa = self.writer.host.ssa(f);
            match classify(&ssa.il, u) {
                UseShape::CallArgument { target, index, .. } => {
                    let t = match self.writer.host.function_at(target) {
                        Some(t) => t,
                        None => {
                            debug!("Call target is not a known function";
                                   "target" => format!("{:#x}", target));
                            continue;
                        }
                    };
                    let from = self.writer.variable_location(f, var.var);
                    let changed = self
                        .writer
                        .parameter(t, index, ty, Some(from), "call argument");
                    if changed || !self.visited_functions.contains(&t) {
                        self.queue.push(t);
                    }
                }
                UseShape::GlobalStore { address } => {
                    let from = self.writer.variable_location(f, var.var);
                    self.writer.global(address, ty, Some(from), "global store");
                }
                UseShape::FieldDeref {
                    field, consumer, ..
                } => {
                    if !self.writer.tracked.is_tracked(&field.ty) {
                        continue;
                    }
                    let from = Location::Field {
                        struct_name: field.struct_name.clone(),
                        member: field.member.clone(),
                    };
                    match consumer {
                        FieldConsumer::Local(v) => {
                            self.writer
                                .variable(f, v.var, &field.ty, Some(from), "field read");
                            self.refresh(f);
                            // A local that kept a different tracked type passes that one on
                            match self.writer.host.variable(f, v.var) {
                                Some(vi) if self.writer.tracked.is_tracked(&vi.ty) => {
                                    self.propagate_variable(f, v, &vi.ty)
                                }
                                _ => {}
                            }
                        }
                        FieldConsumer::Global(address) => {
                            self.writer
                                .global(address, &field.ty, Some(from), "field store");
                        }
                        FieldConsumer::Other => {}
                    }
                }
                UseShape::Unmatched => {}
            }
        }
    }

    fn type_well_known_globals(&mut self) {
        for (name, struct_name) in WELL_KNOWN_GLOBALS {
            if let Some(address) = self.writer.host.symbol_by_name(name) {
                let ty = Type::named(struct_name).pointer();
                self.writer.global(address, &ty, None, "well-known global");
            }
        }
    }
}
