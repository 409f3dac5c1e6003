//! The registry of known GUIDs, and of the protocol structs that some of them designate.

use std::path::Path;

use itertools::Itertools;

use crate::containers::unordered::UnorderedMap;
use crate::error::{DefinitionError, Error, Result};
use crate::log::*;

/// The raw, on-disk layout of an `EFI_GUID`
pub type GuidBytes = [u8; 16];

/// A GUID along with the symbolic name it is known by
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnownIdentifier {
    pub bytes: GuidBytes,
    pub name: String,
}

/// The association of a protocol GUID to the struct type of the interface it designates
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub guid: GuidBytes,
    pub guid_name: String,
    pub struct_name: String,
}

/// Exact-byte lookups of known GUIDs and protocol bindings. Immutable once built.
#[derive(Debug)]
pub struct Registry {
    names: UnorderedMap<GuidBytes, String>,
    bindings: UnorderedMap<GuidBytes, Binding>,
}

lazy_static::lazy_static! {
    static ref BUNDLED: std::result::Result<Registry, DefinitionError> = Registry::parse(
        ("efi_guids.txt", include_str!("../data/efi_guids.txt")),
        ("efi_protocols.txt", include_str!("../data/efi_protocols.txt")),
    );
}

impl Registry {
    /// The bundled registry. Parsed once per process; later calls return the same instance.
    pub fn load() -> Result<&'static Registry> {
        BUNDLED.as_ref().map_err(|e| Error::Definition(e.clone()))
    }

    /// Build a registry from user-provided sources, falling back to the bundled source for
    /// whichever one is not provided.
    pub fn from_files(guids: Option<&Path>, protocols: Option<&Path>) -> Result<Registry> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|source| Error::Io {
                path: path.to_owned(),
                source,
            })
        };
        let guid_source = match guids {
            Some(p) => (p.display().to_string(), read(p)?),
            None => (
                "efi_guids.txt".to_owned(),
                include_str!("../data/efi_guids.txt").to_owned(),
            ),
        };
        let protocol_source = match protocols {
            Some(p) => (p.display().to_string(), read(p)?),
            None => (
                "efi_protocols.txt".to_owned(),
                include_str!("../data/efi_protocols.txt").to_owned(),
            ),
        };
        Ok(Registry::parse(
            (guid_source.0.as_str(), guid_source.1.as_str()),
            (protocol_source.0.as_str(), protocol_source.1.as_str()),
        )?)
    }

    /// Parse a registry from `(source_name, source)` pairs of an identifier source and a binding
    /// source. If the same GUID is declared more than once, the first declaration wins.
    pub fn parse(
        guids: (&str, &str),
        protocols: (&str, &str),
    ) -> std::result::Result<Registry, DefinitionError> {
        let mut names: UnorderedMap<GuidBytes, String> = Default::default();
        let mut bindings: UnorderedMap<GuidBytes, Binding> = Default::default();

        for ident in parse_identifiers(guids.0, guids.1)? {
            insert_first(&mut names, ident.bytes, ident.name);
        }
        for binding in parse_bindings(protocols.0, protocols.1)? {
            insert_first(&mut names, binding.guid, binding.guid_name.clone());
            if let Some(prev) = bindings.get(&binding.guid) {
                debug!("Ignoring duplicate protocol binding";
                       "kept" => &prev.struct_name,
                       "ignored" => &binding.struct_name);
                continue;
            }
            bindings.insert(binding.guid, binding);
        }

        debug!("Loaded GUID registry"; "guids" => names.len(), "bindings" => bindings.len());
        Ok(Registry { names, bindings })
    }

    /// The name of the GUID whose bytes are exactly `bytes`
    pub fn lookup(&self, bytes: &GuidBytes) -> Option<&str> {
        self.names.get(bytes).map(|s| s.as_str())
    }

    /// The protocol binding for exactly `bytes`
    pub fn binding(&self, bytes: &GuidBytes) -> Option<&Binding> {
        self.bindings.get(bytes)
    }

    /// All protocol bindings
    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.values()
    }

    /// Number of known GUIDs
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn insert_first(names: &mut UnorderedMap<GuidBytes, String>, bytes: GuidBytes, name: String) {
    if let Some(prev) = names.get(&bytes) {
        if prev != &name {
            debug!("Ignoring duplicate GUID name";
                   "guid" => format_guid(&bytes),
                   "kept" => prev,
                   "ignored" => &name);
        }
        return;
    }
    names.insert(bytes, name);
}

/// The canonical textual form of a GUID, e.g. `5B1B31A1-9562-11D2-8E3F-00A0C969723B`
pub fn format_guid(bytes: &GuidBytes) -> String {
    let data1 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let data2 = u16::from_le_bytes([bytes[4], bytes[5]]);
    let data3 = u16::from_le_bytes([bytes[6], bytes[7]]);
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{}",
        data1,
        data2,
        data3,
        bytes[8],
        bytes[9],
        bytes[10..].iter().map(|b| format!("{:02X}", b)).join("")
    )
}

/// Parse a C initializer `{0x..., 0x..., 0x..., {0x.., ×8}}` into the packed `EFI_GUID` layout
fn parse_guid_initializer(s: &str) -> Option<GuidBytes> {
    let parts: Vec<u64> = s
        .split(|c: char| c == ',' || c == '{' || c == '}')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let p = p.trim_end_matches(|c: char| c == 'u' || c == 'U' || c == 'l' || c == 'L');
            match p.strip_prefix("0x").or_else(|| p.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => p.parse().ok(),
            }
        })
        .collect::<Option<_>>()?;
    if parts.len() != 11 {
        return None;
    }
    let mut bytes = [0u8; 16];
    bytes[0..4].copy_from_slice(&u32::try_from(parts[0]).ok()?.to_le_bytes());
    bytes[4..6].copy_from_slice(&u16::try_from(parts[1]).ok()?.to_le_bytes());
    bytes[6..8].copy_from_slice(&u16::try_from(parts[2]).ok()?.to_le_bytes());
    for (b, p) in bytes[8..].iter_mut().zip(&parts[3..]) {
        *b = u8::try_from(*p).ok()?;
    }
    Some(bytes)
}

/// Parse `///@guid {...}` annotations, each followed by a line `EFI_GUID name;`
fn parse_identifiers(
    source_name: &str,
    source: &str,
) -> std::result::Result<Vec<KnownIdentifier>, DefinitionError> {
    let mut res = vec![];
    let mut pending: Option<(usize, GuidBytes)> = None;
    for (lineno, line) in source.lines().enumerate() {
        let lineno = lineno + 1;
        let line = line.trim();
        if let Some(init) = line.strip_prefix("///@guid") {
            if let Some((prev, _)) = pending {
                return Err(DefinitionError::new(
                    source_name,
                    prev,
                    "GUID annotation without a following declaration",
                ));
            }
            let bytes = parse_guid_initializer(init)
                .ok_or_else(|| DefinitionError::new(source_name, lineno, "malformed GUID"))?;
            pending = Some((lineno, bytes));
        } else if let Some((_, bytes)) = pending.take() {
            let name = line
                .strip_prefix("EFI_GUID")
                .and_then(|r| r.trim().strip_suffix(';'))
                .map(str::trim)
                .filter(|n| !n.is_empty() && !n.contains(char::is_whitespace))
                .ok_or_else(|| {
                    DefinitionError::new(source_name, lineno, "expected `EFI_GUID name;`")
                })?;
            res.push(KnownIdentifier {
                bytes,
                name: name.to_owned(),
            });
        }
    }
    match pending {
        Some((lineno, _)) => Err(DefinitionError::new(
            source_name,
            lineno,
            "GUID annotation without a following declaration",
        )),
        None => Ok(res),
    }
}

/// Parse `///@protocol`, `///@binding NAME {...}`, `struct NAME` triples
fn parse_bindings(
    source_name: &str,
    source: &str,
) -> std::result::Result<Vec<Binding>, DefinitionError> {
    let mut res = vec![];
    let mut pending: Option<(usize, String, GuidBytes)> = None;
    for (lineno, line) in source.lines().enumerate() {
        let lineno = lineno + 1;
        let err = |reason: &str| DefinitionError::new(source_name, lineno, reason);
        let line = line.trim();
        if line.starts_with("///@protocol") {
            if let Some((prev, _, _)) = &pending {
                return Err(DefinitionError::new(
                    source_name,
                    *prev,
                    "binding without a following struct",
                ));
            }
        } else if let Some(rest) = line.strip_prefix("///@binding") {
            let (name, init) = rest
                .trim()
                .split_once(char::is_whitespace)
                .ok_or_else(|| err("expected `///@binding NAME {GUID}`"))?;
            let guid = parse_guid_initializer(init).ok_or_else(|| err("malformed GUID"))?;
            pending = Some((lineno, name.to_owned(), guid));
        } else if let Some(struct_name) = line.strip_prefix("struct ") {
            let (_, guid_name, guid) = pending
                .take()
                .ok_or_else(|| err("struct without a preceding binding"))?;
            res.push(Binding {
                guid,
                guid_name,
                struct_name: struct_name.trim().trim_end_matches(';').to_owned(),
            });
        }
    }
    match pending {
        Some((lineno, _, _)) => Err(DefinitionError::new(
            source_name,
            lineno,
            "binding without a following struct",
        )),
        None => Ok(res),
    }
}
