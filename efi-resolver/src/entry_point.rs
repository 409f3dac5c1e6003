//! Typing of the module entry point: `EFI_STATUS ModuleEntryPoint(EFI_HANDLE ImageHandle,
//! EFI_SYSTEM_TABLE* SystemTable)`.

use crate::error::{Error, Result};
use crate::host::{AnalysisHost, FunctionId};
use crate::log::*;
use crate::trace::{Location, Trace};
use crate::types::Type;

/// The type whose presence in the host's type universe marks an EFI binary
pub const ROOT_TYPE: &str = "EFI_SYSTEM_TABLE";

/// Name and type the entry function and its two parameters, returning the entry function (or
/// `None` if the host knows of no entry function). Fails without modifying anything if the
/// host's type universe does not know [`ROOT_TYPE`].
pub fn retype_entry<H: AnalysisHost + ?Sized>(
    host: &mut H,
    trace: &mut Trace,
) -> Result<Option<FunctionId>> {
    if host.lookup_type(ROOT_TYPE).is_none() {
        return Err(Error::PlatformMismatch {
            root_type: ROOT_TYPE.to_owned(),
        });
    }
    let f = match host.entry_function() {
        Some(f) => f,
        None => {
            warn!("No entry function to type");
            return Ok(None);
        }
    };

    info!("Typing entry point"; "was" => host.function_name(f));
    host.set_function_name(f, "ModuleEntryPoint");
    host.set_return_type(f, Type::named("EFI_STATUS"));
    let params = [
        ("ImageHandle", Type::named("EFI_HANDLE")),
        ("SystemTable", Type::named(ROOT_TYPE).pointer()),
    ];
    for (index, (name, ty)) in params.iter().enumerate() {
        host.set_parameter(f, index, name, ty.clone());
        trace.record(
            None,
            Location::Variable {
                function: "ModuleEntryPoint".into(),
                variable: (*name).to_owned(),
            },
            ty,
            "entry point",
        );
    }
    host.reanalyze(f);
    Ok(Some(f))
}
