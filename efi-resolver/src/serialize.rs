//! Serialize an analysis database back to the exported form read by
//! [`exported_lifter`](crate::exported_lifter), including every name and type assigned during
//! resolution.

use itertools::Itertools;

use crate::database::AnalysisDatabase;
use crate::host::AnalysisHost;
use crate::types::TypeDefinition;

/// Serialize the database
pub fn serialize(db: &AnalysisDatabase) -> String {
    let mut res = String::new();
    // Writing into a `String` cannot fail
    let _ = serialize_to(db, &mut res);
    res
}

fn serialize_to(db: &AnalysisDatabase, f: &mut String) -> std::fmt::Result {
    use std::fmt::Write;

    writeln!(f, "PROGRAM")?;
    writeln!(f, "name {}", db.name)?;
    writeln!(f, "platform {}", db.platform())?;
    writeln!(f, "pointer_size {}", db.pointer_size())?;
    if let Some(entry) = db.entry_address() {
        writeln!(f, "entry {:#x}", entry)?;
    }
    writeln!(f)?;

    writeln!(f, "TYPES")?;
    for (name, def) in db.types() {
        match def {
            TypeDefinition::Alias(ty) => writeln!(f, "typedef {} {}", name, ty)?,
            TypeDefinition::Struct { fields } => {
                writeln!(f, "struct {}", name)?;
                for field in fields {
                    writeln!(f, "\t{} {}", field.ty, field.name)?;
                }
            }
        }
    }
    writeln!(f)?;

    writeln!(f, "SEGMENTS")?;
    for (seg, bytes) in db.segment_contents() {
        let perms = [
            (seg.readable, 'r'),
            (seg.writable, 'w'),
            (seg.executable, 'x'),
        ]
        .iter()
        .map(|&(set, c)| if set { c } else { '-' })
        .collect::<String>();
        writeln!(
            f,
            "{:#x} {} {}",
            seg.start,
            perms,
            bytes.iter().map(|b| format!("{:02x}", b)).join("")
        )?;
    }
    writeln!(f)?;

    writeln!(f, "SYMBOLS")?;
    for (addr, name) in db.symbols() {
        writeln!(f, "{:#x} {}", addr, name)?;
    }
    writeln!(f)?;

    writeln!(f, "DATA_VARIABLES")?;
    for (addr, ty) in db.data_variables() {
        writeln!(f, "{:#x} {}", addr, ty)?;
    }
    writeln!(f)?;

    writeln!(f, "FUNCTIONS")?;
    for rec in db.function_records() {
        writeln!(f, "FUNCTION {:#x} {:#x} {}", rec.start, rec.end, rec.name)?;
        writeln!(f, "RETURN {}", rec.return_type)?;
        for v in &rec.variables {
            writeln!(
                f,
                "{} {} {}",
                if v.is_parameter { "PARAM" } else { "LOCAL" },
                v.name,
                v.ty
            )?;
        }
        let il = rec.il();
        for s in il.statements() {
            writeln!(f, "{:#x} {}", il.node(s).address, il.display(s))?;
        }
        writeln!(f)?;
    }

    Ok(())
}
