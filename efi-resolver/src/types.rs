//! C-like types as they exist in the analysis host's type universe, along with the bundled EFI
//! type library that gets imported into it.

use crate::containers::unordered::UnorderedMap;
use crate::error::DefinitionError;
use crate::log::*;

/// A type attached to a variable, parameter, or data location.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    /// Nothing is known; used for derived types that the host could not compute
    Unknown,
    Void,
    /// A fixed-size integer; `size: None` is pointer-sized (`uintptr_t`/`intptr_t`)
    Int { size: Option<usize>, signed: bool },
    /// A reference to a named type (struct or typedef) in the type universe
    Named(String),
    Pointer(Box<Type>),
    Array(Box<Type>, usize),
}

impl Type {
    /// A pointer to `self`
    pub fn pointer(self) -> Type {
        Type::Pointer(Box::new(self))
    }

    /// Reference to the named type `name`
    pub fn named(name: impl Into<String>) -> Type {
        Type::Named(name.into())
    }

    /// The pointee, if this is a pointer
    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Pointer(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    /// If this is a (possibly multi-level) pointer to a named type, returns the number of pointer
    /// levels along with the name, stripped of any leading underscores (`struct _FOO` and `FOO`
    /// name the same type).
    pub fn pointer_to_named(&self) -> Option<(usize, &str)> {
        let mut depth = 0;
        let mut t = self;
        while let Type::Pointer(inner) = t {
            depth += 1;
            t = inner;
        }
        match t {
            Type::Named(name) if depth > 0 => Some((depth, name.trim_start_matches('_'))),
            _ => None,
        }
    }

    /// Parse a type from its textual form, e.g. `EFI_SYSTEM_TABLE*`, `struct _FOO**`, `uint8_t[8]`.
    pub fn parse(s: &str) -> Option<Type> {
        let s = s.trim();
        if let Some(inner) = s.strip_suffix('*') {
            return Some(Type::parse(inner)?.pointer());
        }
        if let Some(inner) = s.strip_suffix(']') {
            let (elem, count) = inner.rsplit_once('[')?;
            return Some(Type::Array(
                Box::new(Type::parse(elem)?),
                count.trim().parse().ok()?,
            ));
        }
        let s = s.strip_prefix("struct ").unwrap_or(s).trim();
        Some(match s {
            "?" => Type::Unknown,
            "void" => Type::Void,
            "uintptr_t" => Type::Int {
                size: None,
                signed: false,
            },
            "intptr_t" => Type::Int {
                size: None,
                signed: true,
            },
            _ => {
                if let Some((signed, bits)) = s
                    .strip_prefix("uint")
                    .map(|r| (false, r))
                    .or_else(|| s.strip_prefix("int").map(|r| (true, r)))
                    .and_then(|(signed, r)| Some((signed, r.strip_suffix("_t")?)))
                {
                    let size = match bits {
                        "8" => 1,
                        "16" => 2,
                        "32" => 4,
                        "64" => 8,
                        _ => return None,
                    };
                    Type::Int {
                        size: Some(size),
                        signed,
                    }
                } else if !s.is_empty()
                    && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    && !s.starts_with(|c: char| c.is_ascii_digit())
                {
                    Type::Named(s.to_owned())
                } else {
                    return None;
                }
            }
        })
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Type::Unknown => write!(f, "?"),
            Type::Void => write!(f, "void"),
            Type::Int { size: None, signed } => {
                write!(f, "{}intptr_t", if *signed { "" } else { "u" })
            }
            Type::Int {
                size: Some(size),
                signed,
            } => write!(f, "{}int{}_t", if *signed { "" } else { "u" }, size * 8),
            Type::Named(name) => write!(f, "{}", name),
            Type::Pointer(t) => write!(f, "{}*", t),
            Type::Array(t, n) => write!(f, "{}[{}]", t, n),
        }
    }
}

impl std::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "`{}`", self)
    }
}

/// A laid-out struct member
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Field {
    pub offset: u64,
    pub name: String,
    pub ty: Type,
}

/// The definition of a named type
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TypeDefinition {
    /// A struct with laid-out fields. Structs with no fields are opaque.
    Struct { fields: Vec<Field> },
    /// A typedef
    Alias(Type),
}

impl TypeDefinition {
    /// The field starting exactly at `offset`, if this is a struct that has one
    pub fn field_at(&self, offset: u64) -> Option<&Field> {
        match self {
            TypeDefinition::Struct { fields } => fields.iter().find(|f| f.offset == offset),
            TypeDefinition::Alias(_) => None,
        }
    }
}

/// A library of type definitions whose struct layouts are computed for a given pointer size.
///
/// The source format is line oriented:
///
/// ```text
/// typedef EFI_HANDLE void*
/// struct EFI_TABLE_HEADER
///     uint64_t Signature
///     uint32_t Revision
/// ```
///
/// where struct members are tab-indented `TYPE NAME` pairs in declaration order.
pub struct TypeLibrary {
    /// Declarations in source order
    decls: Vec<(String, Decl)>,
}

enum Decl {
    Struct(Vec<(Type, String)>),
    Alias(Type),
}

impl TypeLibrary {
    /// Parse a type library, where `source_name` is only used for error messages
    pub fn parse(source_name: &str, source: &str) -> Result<Self, DefinitionError> {
        let mut decls: Vec<(String, Decl)> = vec![];
        for (lineno, line) in source.lines().enumerate() {
            let lineno = lineno + 1;
            let err = |reason: &str| DefinitionError::new(source_name, lineno, reason);
            if line.trim().is_empty() || line.trim_start().starts_with("//") {
                continue;
            }
            if line.starts_with('\t') || line.starts_with(' ') {
                let (ty, name) = line
                    .trim()
                    .rsplit_once(' ')
                    .ok_or_else(|| err("expected `TYPE NAME` struct member"))?;
                let ty = Type::parse(ty).ok_or_else(|| err("unparseable member type"))?;
                match decls.last_mut() {
                    Some((_, Decl::Struct(members))) => members.push((ty, name.trim().to_owned())),
                    _ => return Err(err("struct member outside of a struct")),
                }
            } else if let Some(rest) = line.strip_prefix("typedef ") {
                let (name, ty) = rest
                    .trim()
                    .split_once(' ')
                    .ok_or_else(|| err("expected `typedef NAME TYPE`"))?;
                let ty = Type::parse(ty).ok_or_else(|| err("unparseable typedef target"))?;
                decls.push((name.to_owned(), Decl::Alias(ty)));
            } else if let Some(name) = line.strip_prefix("struct ") {
                decls.push((name.trim().to_owned(), Decl::Struct(vec![])));
            } else {
                return Err(err("expected `typedef`, `struct`, or an indented member"));
            }
        }
        Ok(Self { decls })
    }

    /// The bundled EFI type library
    pub fn bundled() -> Result<Self, DefinitionError> {
        Self::parse("efi_types.txt", include_str!("../data/efi_types.txt"))
    }

    /// Names declared in this library, in declaration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.decls.iter().map(|(n, _)| n.as_str())
    }

    /// Compute the definitions of all declared types, laying out structs with natural alignment
    /// for a target with the given `pointer_size`.
    pub fn layout(&self, pointer_size: usize) -> Result<Vec<(String, TypeDefinition)>, String> {
        let mut layouts: UnorderedMap<String, (TypeDefinition, usize, usize)> =
            Default::default();
        let mut res = vec![];
        for (name, decl) in &self.decls {
            let (def, size, align) = match decl {
                Decl::Alias(ty) => {
                    let (size, align) = size_align(ty, pointer_size, &layouts)
                        .ok_or_else(|| format!("typedef {} refers to an unknown type", name))?;
                    (TypeDefinition::Alias(ty.clone()), size, align)
                }
                Decl::Struct(members) => {
                    let mut offset = 0;
                    let mut max_align = 1;
                    let mut fields = vec![];
                    for (ty, member) in members {
                        let (size, align) = size_align(ty, pointer_size, &layouts).ok_or_else(
                            || format!("member {}.{} has a type of unknown size", name, member),
                        )?;
                        offset = round_up(offset, align);
                        fields.push(Field {
                            offset: offset as u64,
                            name: member.clone(),
                            ty: ty.clone(),
                        });
                        offset += size;
                        max_align = max_align.max(align);
                    }
                    (
                        TypeDefinition::Struct { fields },
                        round_up(offset, max_align),
                        max_align,
                    )
                }
            };
            trace!("Laid out type"; "name" => name, "size" => size, "align" => align);
            layouts.insert(name.clone(), (def.clone(), size, align));
            res.push((name.clone(), def));
        }
        Ok(res)
    }
}

fn round_up(v: usize, align: usize) -> usize {
    (v + align - 1) / align * align
}

fn size_align(
    ty: &Type,
    pointer_size: usize,
    known: &UnorderedMap<String, (TypeDefinition, usize, usize)>,
) -> Option<(usize, usize)> {
    match ty {
        Type::Unknown | Type::Void => None,
        Type::Int { size: None, .. } | Type::Pointer(_) => Some((pointer_size, pointer_size)),
        Type::Int { size: Some(s), .. } => Some((*s, *s)),
        Type::Array(elem, n) => {
            let (size, align) = size_align(elem, pointer_size, known)?;
            Some((size * n, align))
        }
        Type::Named(name) => known.get(name).map(|&(_, size, align)| (size, align)),
    }
}
