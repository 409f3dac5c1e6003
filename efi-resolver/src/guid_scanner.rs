//! Recognition of known GUIDs in the binary's data.

use crate::host::AnalysisHost;
use crate::log::*;
use crate::pipeline::{Cancellation, PassStatus};
use crate::registry::{format_guid, GuidBytes, Registry};
use crate::trace::{Location, Trace};
use crate::types::Type;

/// Every `(address, name)` at which the bytes of a known GUID occur in a readable segment.
///
/// Lazy, and restartable by calling again. Windows that would run past the end of a segment
/// never match.
pub fn scan<'a, H: AnalysisHost + ?Sized>(
    host: &'a H,
    registry: &'a Registry,
) -> impl Iterator<Item = (u64, &'a str)> + 'a {
    host.segments()
        .into_iter()
        .filter(|seg| seg.readable)
        .flat_map(move |seg| {
            let bytes = host.read(seg.start, (seg.end - seg.start) as usize);
            let windows = bytes.len().saturating_sub(std::mem::size_of::<GuidBytes>() - 1);
            (0..windows).filter_map(move |i| {
                let window: GuidBytes = bytes[i..i + 16].try_into().ok()?;
                registry
                    .lookup(&window)
                    .map(|name| (seg.start + i as u64, name))
            })
        })
}

/// Result of annotating known GUIDs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanOutcome {
    pub status: PassStatus,
    /// Number of locations newly annotated
    pub annotated: usize,
}

/// Name and type every known GUID found in data. Matches inside functions are skipped, as are
/// locations that already hold a data variable of a type other than `void`.
pub fn apply_known_guids<H: AnalysisHost + ?Sized, C: Cancellation + ?Sized>(
    host: &mut H,
    registry: &Registry,
    cancel: &C,
    trace: &mut Trace,
) -> ScanOutcome {
    let matches: Vec<(u64, String)> = scan(&*host, registry)
        .map(|(addr, name)| (addr, name.to_owned()))
        .collect();
    debug!("Found known GUIDs"; "count" => matches.len());

    let mut annotated = 0;
    for (addr, name) in matches {
        if cancel.is_cancelled() {
            return ScanOutcome {
                status: PassStatus::Cancelled,
                annotated,
            };
        }
        if !host.functions_containing(addr).is_empty() {
            warn!("Found GUID in code, skipping";
                  "name" => &name,
                  "address" => format!("{:#x}", addr));
            continue;
        }
        match host.data_variable_at(addr) {
            Some(ty) if !ty.is_void() => {
                trace!("GUID location already typed";
                       "name" => &name,
                       "address" => format!("{:#x}", addr),
                       "type" => %ty);
                continue;
            }
            _ => {}
        }
        let guid: Option<GuidBytes> = host.read(addr, 16).try_into().ok();
        info!("Annotating GUID";
              "name" => &name,
              "address" => format!("{:#x}", addr),
              "guid" => guid.map(|g| format_guid(&g)).unwrap_or_default());
        host.define_data_symbol(addr, &name);
        host.define_data_variable(addr, Type::named("EFI_GUID"));
        trace.record(
            None,
            Location::Global {
                address: addr,
                name: Some(name),
            },
            &Type::named("EFI_GUID"),
            "known GUID",
        );
        annotated += 1;
    }

    ScanOutcome {
        status: PassStatus::Completed,
        annotated,
    }
}
