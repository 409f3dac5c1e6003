//! The top-level resolution pipeline: platform types, entry point, known GUIDs, propagation, and
//! then rounds of protocol resolution until nothing more is learnt. Within a round, each idiom is
//! resolved and its results propagated in turn.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::entry_point::{retype_entry, ROOT_TYPE};
use crate::error::{DefinitionError, Result};
use crate::guid_scanner::apply_known_guids;
use crate::host::{AnalysisHost, FunctionId};
use crate::log::*;
use crate::propagation::{propagate, Seed, TrackedTypes};
use crate::protocols::{resolve_idiom, DispatchIdiom};
use crate::registry::Registry;
use crate::resolver_config::CONFIG;
use crate::trace::Trace;
use crate::types::{TypeDefinition, TypeLibrary};

/// A cooperative cancellation flag, polled between units of work
pub trait Cancellation {
    fn is_cancelled(&self) -> bool;
}

impl Cancellation for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

/// A [`Cancellation`] that is never set
pub struct NeverCancelled;

impl Cancellation for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassStatus {
    Completed,
    /// Stopped early; everything done before stopping is kept
    Cancelled,
}

/// Summary of a [`resolve_efi`] run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionReport {
    pub status: PassStatus,
    /// The typed entry function, if the host knows one
    pub entry: Option<FunctionId>,
    pub types_imported: usize,
    pub guids_annotated: usize,
    /// Number of variables and globals whose type changed during propagation
    pub types_propagated: usize,
    /// Number of dispatch sites matched to a known protocol in the last round
    pub sites_resolved: usize,
    /// Number of protocol resolution rounds run
    pub rounds: usize,
}

impl ResolutionReport {
    fn new() -> Self {
        Self {
            status: PassStatus::Completed,
            entry: None,
            types_imported: 0,
            guids_annotated: 0,
            types_propagated: 0,
            sites_resolved: 0,
            rounds: 0,
        }
    }

    fn cancelled(mut self) -> Self {
        warn!("Resolution cancelled");
        self.status = PassStatus::Cancelled;
        self
    }
}

/// Define the bundled EFI types, and an opaque struct for every bound protocol, wherever the host
/// does not already know a type of that name. Returns the number of types defined.
pub fn import_platform_types<H: AnalysisHost + ?Sized>(
    host: &mut H,
    registry: &Registry,
) -> Result<usize> {
    let layouts = TypeLibrary::bundled()?
        .layout(host.pointer_size())
        .map_err(|reason| DefinitionError::new("efi_types.txt", 0, reason))?;
    let opaque = registry
        .bindings()
        .map(|b| (b.struct_name.clone(), TypeDefinition::Struct { fields: vec![] }));

    let mut defined = 0;
    for (name, def) in layouts.into_iter().chain(opaque) {
        if host.lookup_type(&name).is_none() {
            trace!("Importing type"; "name" => &name);
            host.define_type(&name, def);
            defined += 1;
        }
    }
    debug!("Imported platform types"; "count" => defined);
    Ok(defined)
}

/// Recover EFI types in the binary held by `host`.
///
/// Fails (before changing anything besides imported types) if the binary does not target the EFI
/// platform. Cancellation is not an error: the report says where things stopped.
pub fn resolve_efi<H: AnalysisHost + ?Sized, C: Cancellation + ?Sized>(
    host: &mut H,
    registry: &Registry,
    cancel: &C,
    trace: &mut Trace,
) -> Result<ResolutionReport> {
    let mut report = ResolutionReport::new();

    let platform = host.platform();
    if platform.starts_with("efi-") && CONFIG.import_platform_types {
        report.types_imported = import_platform_types(host, registry)?;
    } else if host.lookup_type(ROOT_TYPE).is_none() {
        info!("Not importing EFI types"; "platform" => &platform);
    }

    report.entry = retype_entry(host, trace)?;
    if cancel.is_cancelled() {
        return Ok(report.cancelled());
    }

    if CONFIG.enable_guid_scan {
        let out = apply_known_guids(host, registry, cancel, trace);
        report.guids_annotated += out.annotated;
        if out.status == PassStatus::Cancelled {
            return Ok(report.cancelled());
        }
    }

    let tracked = TrackedTypes::new(registry);
    let out = propagate(host, &tracked, report.entry.map(Seed::Function), cancel, trace);
    report.types_propagated += out.changes;
    if out.status == PassStatus::Cancelled {
        return Ok(report.cancelled());
    }

    if CONFIG.enable_protocol_resolution {
        loop {
            report.rounds += 1;
            let mut changes = 0;
            let mut resolved = 0;
            // Each idiom's results are propagated before the next idiom looks for sites
            for idiom in DispatchIdiom::ALL {
                let out = resolve_idiom(host, registry, &tracked, idiom, cancel, trace);
                changes += out.changes;
                resolved += out.resolved;
                if out.status == PassStatus::Cancelled {
                    report.sites_resolved = resolved;
                    return Ok(report.cancelled());
                }

                let out = propagate(host, &tracked, out.seeds, cancel, trace);
                changes += out.changes;
                report.types_propagated += out.changes;
                if out.status == PassStatus::Cancelled {
                    report.sites_resolved = resolved;
                    return Ok(report.cancelled());
                }
            }
            report.sites_resolved = resolved;

            debug!("Resolution round done";
                   "round" => report.rounds,
                   "resolved" => resolved,
                   "changes" => changes);
            if changes == 0 || CONFIG.single_resolution_round {
                break;
            }
        }
    }

    info!("Resolution complete";
          "guids_annotated" => report.guids_annotated,
          "types_propagated" => report.types_propagated,
          "sites_resolved" => report.sites_resolved,
          "rounds" => report.rounds);
    Ok(report)
}
