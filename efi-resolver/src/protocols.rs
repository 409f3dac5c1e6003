//! Resolution of protocol interfaces at boot services dispatch sites.
//!
//! A call through `BootServices->LocateProtocol` (or `HandleProtocol`/`OpenProtocol`) whose GUID
//! argument is a constant address holding a known protocol GUID tells us the type of the
//! interface pointer written through its output argument.

use crate::constant_folding::ConstFolded;
use crate::host::{AnalysisHost, FunctionId};
use crate::il::{ExprId, ExprKind};
use crate::log::*;
use crate::pipeline::{Cancellation, PassStatus};
use crate::propagation::{Seed, TrackedTypes, TypeWriter};
use crate::registry::{format_guid, GuidBytes, Registry};
use crate::trace::{Location, Trace};
use crate::types::Type;

/// The struct whose members are dispatched through
pub const DISPATCH_TABLE: &str = "EFI_BOOT_SERVICES";

/// A boot services member that hands out a protocol interface
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DispatchIdiom {
    /// `HandleProtocol(Handle, Protocol, Interface)`
    HandleProtocol,
    /// `OpenProtocol(Handle, Protocol, Interface, AgentHandle, ControllerHandle, Attributes)`
    OpenProtocol,
    /// `LocateProtocol(Protocol, Registration, Interface)`
    LocateProtocol,
}

impl DispatchIdiom {
    pub const ALL: [DispatchIdiom; 3] = [
        DispatchIdiom::HandleProtocol,
        DispatchIdiom::OpenProtocol,
        DispatchIdiom::LocateProtocol,
    ];

    pub fn member_name(self) -> &'static str {
        match self {
            DispatchIdiom::HandleProtocol => "HandleProtocol",
            DispatchIdiom::OpenProtocol => "OpenProtocol",
            DispatchIdiom::LocateProtocol => "LocateProtocol",
        }
    }

    /// Index of the argument pointing at the protocol GUID
    pub fn guid_argument(self) -> usize {
        match self {
            DispatchIdiom::HandleProtocol | DispatchIdiom::OpenProtocol => 1,
            DispatchIdiom::LocateProtocol => 0,
        }
    }

    /// Index of the argument through which the interface pointer is returned
    pub fn interface_argument(self) -> usize {
        2
    }
}

/// A call to a dispatch idiom
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchSite {
    pub function: FunctionId,
    /// The call expression
    pub call: ExprId,
    /// Address of the call instruction
    pub address: u64,
}

/// All calls through the [`DISPATCH_TABLE`] member of `idiom`, in function order. Functions whose
/// derived information is out of date are re-analyzed first.
pub fn find_dispatch_sites<H: AnalysisHost + ?Sized>(
    host: &mut H,
    idiom: DispatchIdiom,
) -> Vec<DispatchSite> {
    let mut res = vec![];
    for f in host.functions() {
        if host.needs_reanalysis(f) {
            host.reanalyze(f);
        }
        let ssa = host.ssa(f);
        let il = &ssa.il;
        for e in il.exprs() {
            let dest = match il.kind(e) {
                ExprKind::Call { dest, .. } => *dest,
                _ => continue,
            };
            match il.kind(dest) {
                ExprKind::DerefField {
                    field: Some(fr), ..
                } if fr.struct_name.trim_start_matches('_') == DISPATCH_TABLE
                    && fr.member == idiom.member_name() =>
                {
                    res.push(DispatchSite {
                        function: f,
                        call: e,
                        address: il.node(e).address,
                    })
                }
                _ => {}
            }
        }
    }
    res
}

/// Result of resolving one idiom
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolverOutcome {
    pub status: PassStatus,
    /// Where propagation should continue from
    pub seeds: Vec<Seed>,
    /// Number of sites whose GUID argument matched a known protocol
    pub resolved: usize,
    /// Number of locations whose name or type was changed
    pub changes: usize,
}

/// Resolve every dispatch site of `idiom`: name the GUID passed to it, and type the interface
/// pointer it outputs.
pub fn resolve_idiom<H: AnalysisHost + ?Sized, C: Cancellation + ?Sized>(
    host: &mut H,
    registry: &Registry,
    tracked: &TrackedTypes,
    idiom: DispatchIdiom,
    cancel: &C,
    trace: &mut Trace,
) -> ResolverOutcome {
    let sites = find_dispatch_sites(host, idiom);
    debug!("Found dispatch sites"; "idiom" => idiom.member_name(), "count" => sites.len());

    let mut writer = TypeWriter::new(host, tracked, trace);
    let mut outcome = ResolverOutcome {
        status: PassStatus::Completed,
        seeds: vec![],
        resolved: 0,
        changes: 0,
    };
    for site in sites {
        if cancel.is_cancelled() {
            outcome.status = PassStatus::Cancelled;
            break;
        }
        let seeds = resolve_site(&mut writer, registry, idiom, site, &mut outcome);
        outcome.seeds.extend(seeds);
    }
    outcome.changes += writer.changes;
    outcome
}

fn resolve_site<H: AnalysisHost + ?Sized>(
    writer: &mut TypeWriter<H>,
    registry: &Registry,
    idiom: DispatchIdiom,
    site: DispatchSite,
    outcome: &mut ResolverOutcome,
) -> Vec<Seed> {
    let f = site.function;
    let ssa = writer.host.ssa(f);
    let il = &ssa.il;
    let params = match il.kind(site.call) {
        ExprKind::Call { params, .. } => params.clone(),
        _ => return vec![],
    };
    let (guid_arg, out_arg) = match (
        params.get(idiom.guid_argument()),
        params.get(idiom.interface_argument()),
    ) {
        (Some(g), Some(o)) => (*g, *o),
        _ => {
            debug!("Too few arguments at dispatch site";
                   "idiom" => idiom.member_name(),
                   "address" => format!("{:#x}", site.address));
            return vec![];
        }
    };

    let folded = ConstFolded::from_ssa(&ssa);
    let guid_address = match folded.address_of(guid_arg) {
        Some(a) => a,
        None => {
            debug!("GUID argument is not a constant address";
                   "idiom" => idiom.member_name(),
                   "address" => format!("{:#x}", site.address),
                   "arg" => %il.display(guid_arg));
            return vec![];
        }
    };
    let guid: GuidBytes = match writer.host.read(guid_address, 16).try_into() {
        Ok(g) => g,
        Err(_) => {
            debug!("GUID argument points outside of mapped memory";
                   "guid_address" => format!("{:#x}", guid_address));
            return vec![];
        }
    };
    let binding = match registry.binding(&guid) {
        Some(b) => b,
        None => {
            debug!("No protocol bound to GUID"; "guid" => format_guid(&guid));
            return vec![];
        }
    };
    outcome.resolved += 1;

    let call_site = Location::CallSite {
        function: writer.host.function_name(f),
        address: site.address,
    };
    name_guid(writer, guid_address, &binding.guid_name, &call_site, outcome);

    let interface = Type::named(&binding.struct_name).pointer();
    let cause = "protocol interface";

    // A global, directly or through copies of its address
    if let Some(address) = folded.address_of(out_arg) {
        writer.global(address, &interface, Some(call_site), cause);
        return vec![];
    }

    match il.kind(out_arg) {
        ExprKind::AddressOf(inner) => match il.as_var(*inner) {
            Some(v) => {
                writer.variable(f, v.var, &interface, Some(call_site), cause);
                vec![Seed::Local {
                    function: f,
                    var: v.var,
                }]
            }
            None => {
                debug!("Unrecognized interface argument";
                       "address" => format!("{:#x}", site.address),
                       "arg" => %il.display(out_arg));
                vec![]
            }
        },
        ExprKind::Var(v) => {
            let mut seeds = vec![];
            // `out = &local` earlier in the function: the local receives the interface
            let pointee = ssa
                .defining_value(*v)
                .and_then(|d| match il.kind(d) {
                    ExprKind::AddressOf(inner) => il.as_var(*inner),
                    _ => None,
                });
            if let Some(p) = pointee {
                writer.variable(f, p.var, &interface, Some(call_site.clone()), cause);
                seeds.push(Seed::Local {
                    function: f,
                    var: p.var,
                });
            }
            writer.variable(f, v.var, &interface.pointer(), Some(call_site), cause);
            if writer.host.parameters(f).contains(&v.var) {
                seeds.push(Seed::Function(f));
            } else {
                seeds.push(Seed::Local {
                    function: f,
                    var: v.var,
                });
            }
            seeds
        }
        _ => {
            debug!("Unrecognized interface argument";
                   "address" => format!("{:#x}", site.address),
                   "arg" => %il.display(out_arg));
            vec![]
        }
    }
}

fn name_guid<H: AnalysisHost + ?Sized>(
    writer: &mut TypeWriter<H>,
    address: u64,
    name: &str,
    call_site: &Location,
    outcome: &mut ResolverOutcome,
) {
    let guid_ty = Type::named("EFI_GUID");
    let mut changed = false;
    if writer.host.symbol_at(address).as_deref() != Some(name) {
        writer.host.define_data_symbol(address, name);
        changed = true;
    }
    match writer.host.data_variable_at(address) {
        Some(ty) if !ty.is_void() => {}
        _ => {
            writer.host.define_data_variable(address, guid_ty.clone());
            changed = true;
        }
    }
    if changed {
        info!("Naming protocol GUID"; "name" => name, "address" => format!("{:#x}", address));
        outcome.changes += 1;
        writer.trace.record(
            Some(call_site.clone()),
            Location::Global {
                address,
                name: Some(name.to_owned()),
            },
            &guid_ty,
            "protocol GUID",
        );
    }
}
