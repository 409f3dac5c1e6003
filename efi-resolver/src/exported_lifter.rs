//! A lifter from an exported analysis database
//!
//! The export is a sectioned text file:
//!
//! ```text
//! PROGRAM
//! name sample.efi
//! platform efi-x86_64
//! pointer_size 8
//! entry 0x1000
//!
//! TYPES
//! typedef EFI_HANDLE void*
//! struct EFI_TABLE_HEADER
//!     uint64_t Signature
//!
//! SEGMENTS
//! 0x1000 r-x 554889e5
//!
//! SYMBOLS
//! 0x3000 gEfiLoadedImageProtocolGuid
//!
//! DATA_VARIABLES
//! 0x3000 EFI_GUID
//!
//! FUNCTIONS
//! FUNCTION 0x1000 0x1040 _ModuleEntryPoint
//! RETURN ?
//! PARAM arg1 void*
//! LOCAL rax_1 void*
//! 0x1004 (init (var 1 1) (field (var 0 0) 0x60))
//! ```
//!
//! `TYPES` uses the [`TypeLibrary`] format (members are tab-indented), laid out for the program's
//! pointer size. Each IL line is a machine address followed by a statement in the s-expression
//! form printed by [`FunctionIl::display`]; `(var N V)` refers to version `V` of the `N`th
//! `PARAM`/`LOCAL` declared for the function.

use itertools::Itertools;

use crate::database::AnalysisDatabase;
use crate::error::{Error, Result};
use crate::host::{AnalysisHost, VariableInfo};
use crate::il::{ExprId, ExprKind, FunctionIl, SsaVariable};
use crate::log::*;
use crate::types::{Type, TypeLibrary};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Section {
    Program,
    Types,
    Segments,
    Symbols,
    DataVariables,
    Functions,
}

impl Section {
    fn from_header(line: &str) -> Option<Self> {
        Some(match line {
            "PROGRAM" => Section::Program,
            "TYPES" => Section::Types,
            "SEGMENTS" => Section::Segments,
            "SYMBOLS" => Section::Symbols,
            "DATA_VARIABLES" => Section::DataVariables,
            "FUNCTIONS" => Section::Functions,
            _ => return None,
        })
    }
}

/// A function whose declaration has been read, but which has not been added to the database yet
struct PendingFunction {
    line: usize,
    name: String,
    bounds: (u64, u64),
    return_type: Type,
    variables: Vec<VariableInfo>,
    il: FunctionIl,
}

/// Lift an exported database into an in-memory analysis database
pub fn lift_from(exported: &str) -> Result<AnalysisDatabase> {
    let mut section: Option<Section> = None;
    let mut seen: Vec<Section> = vec![];

    let mut name: Option<String> = None;
    let mut platform: Option<String> = None;
    let mut pointer_size: Option<usize> = None;
    let mut entry: Option<u64> = None;
    let mut db: Option<AnalysisDatabase> = None;

    let mut types_start = 0;
    let mut types_source = String::new();
    let mut pending: Option<PendingFunction> = None;

    for (lineno, raw) in exported.lines().enumerate() {
        let lineno = lineno + 1;
        let malformed = |reason: String| Error::MalformedExport {
            line: lineno,
            reason,
        };
        let line = raw.trim_end();

        if let Some(s) = Section::from_header(line) {
            if seen.contains(&s) {
                return Err(malformed(format!("duplicate section {:?}", s)));
            }
            if seen.is_empty() && s != Section::Program {
                return Err(malformed("expected PROGRAM section first".into()));
            }
            if s != Section::Program && db.is_none() {
                let (n, p, ps) = match (&name, &platform, pointer_size) {
                    (Some(n), Some(p), Some(ps)) => (n, p, ps),
                    _ => {
                        return Err(malformed(
                            "PROGRAM must declare name, platform, and pointer_size".into(),
                        ))
                    }
                };
                let mut new_db = AnalysisDatabase::new(n, p, ps);
                if let Some(e) = entry {
                    new_db.set_entry(e);
                }
                db = Some(new_db);
            }
            if section == Some(Section::Types) {
                define_types(db.as_mut(), types_start, &types_source)?;
            }
            if s == Section::Types {
                types_start = lineno;
            }
            seen.push(s);
            section = Some(s);
            continue;
        }

        if section == Some(Section::Types) {
            // Type definitions are parsed as a whole once the section ends
            types_source.push_str(raw);
            types_source.push('\n');
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        match (section, db.as_mut()) {
            (None, _) => return Err(malformed("content before the PROGRAM section".into())),
            (Some(Section::Program), _) => {
                let (key, value) = line
                    .split_once(' ')
                    .ok_or_else(|| malformed("expected `key value`".into()))?;
                match key {
                    "name" => name = Some(value.trim().to_owned()),
                    "platform" => platform = Some(value.trim().to_owned()),
                    "pointer_size" => {
                        pointer_size = Some(
                            value
                                .trim()
                                .parse()
                                .map_err(|_| malformed("bad pointer size".into()))?,
                        )
                    }
                    "entry" => {
                        entry = Some(
                            parse_u64(value.trim())
                                .ok_or_else(|| malformed("bad entry address".into()))?,
                        )
                    }
                    k => debug!("Ignoring unknown program property"; "key" => k),
                }
            }
            (Some(_), None) => return Err(malformed("PROGRAM section is incomplete".into())),
            (Some(Section::Types), Some(_)) => unreachable!("handled above"),
            (Some(Section::Segments), Some(db)) => {
                let mut parts = line.splitn(3, ' ');
                let (start, perms) = parts
                    .next()
                    .zip(parts.next())
                    .ok_or_else(|| malformed("expected `START PERMISSIONS BYTES`".into()))?;
                let start =
                    parse_u64(start).ok_or_else(|| malformed("bad segment address".into()))?;
                let bytes = decode_hex(parts.next().unwrap_or("").trim())
                    .ok_or_else(|| malformed("bad segment bytes".into()))?;
                db.add_segment(start, bytes, perms).map_err(malformed)?;
            }
            (Some(Section::Symbols), Some(db)) => {
                let (addr, sym) = line
                    .split_once(' ')
                    .ok_or_else(|| malformed("expected `ADDRESS NAME`".into()))?;
                let addr = parse_u64(addr).ok_or_else(|| malformed("bad address".into()))?;
                db.define_data_symbol(addr, sym.trim());
            }
            (Some(Section::DataVariables), Some(db)) => {
                let (addr, ty) = line
                    .split_once(' ')
                    .ok_or_else(|| malformed("expected `ADDRESS TYPE`".into()))?;
                let addr = parse_u64(addr).ok_or_else(|| malformed("bad address".into()))?;
                let ty = Type::parse(ty).ok_or_else(|| malformed("bad type".into()))?;
                db.define_data_variable(addr, ty);
            }
            (Some(Section::Functions), Some(db)) => {
                if let Some(rest) = line.strip_prefix("FUNCTION ") {
                    if let Some(p) = pending.take() {
                        finish_function(db, p)?;
                    }
                    let (start, end, fname) = rest
                        .splitn(3, ' ')
                        .collect_tuple()
                        .ok_or_else(|| malformed("expected `FUNCTION START END NAME`".into()))?;
                    let bounds = parse_u64(start)
                        .zip(parse_u64(end))
                        .ok_or_else(|| malformed("bad function bounds".into()))?;
                    pending = Some(PendingFunction {
                        line: lineno,
                        name: fname.trim().to_owned(),
                        bounds,
                        return_type: Type::Unknown,
                        variables: vec![],
                        il: FunctionIl::new(),
                    });
                    continue;
                }
                let p = pending
                    .as_mut()
                    .ok_or_else(|| malformed("expected a FUNCTION declaration".into()))?;
                let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
                match head {
                    "RETURN" => {
                        p.return_type =
                            Type::parse(rest).ok_or_else(|| malformed("bad return type".into()))?;
                    }
                    "PARAM" | "LOCAL" => {
                        let (vname, ty) = rest
                            .trim()
                            .split_once(' ')
                            .ok_or_else(|| malformed("expected `NAME TYPE`".into()))?;
                        p.variables.push(VariableInfo {
                            name: vname.to_owned(),
                            ty: Type::parse(ty).ok_or_else(|| malformed("bad type".into()))?,
                            is_parameter: head == "PARAM",
                        });
                    }
                    addr => {
                        let addr = parse_u64(addr)
                            .ok_or_else(|| malformed(format!("unexpected `{}`", addr)))?;
                        let mut tokens = tokenize(rest).into_iter().peekable();
                        let kind = parse_kind(&mut tokens, &mut p.il, addr).map_err(malformed)?;
                        if tokens.next().is_some() {
                            return Err(malformed("trailing tokens after statement".into()));
                        }
                        p.il.push_statement(kind, addr);
                    }
                }
            }
        }
    }

    if section == Some(Section::Types) {
        define_types(db.as_mut(), types_start, &types_source)?;
    }
    let mut db = db.ok_or(Error::MalformedExport {
        line: exported.lines().count(),
        reason: "missing sections after PROGRAM".into(),
    })?;
    if let Some(p) = pending.take() {
        finish_function(&mut db, p)?;
    }

    info!("Lifted exported database";
          "name" => &db.name,
          "functions" => db.function_records().count(),
          "types" => db.types().count());
    Ok(db)
}

fn define_types(db: Option<&mut AnalysisDatabase>, start: usize, source: &str) -> Result<()> {
    let db = match db {
        Some(db) => db,
        None => return Ok(()),
    };
    let lib = TypeLibrary::parse("TYPES", source).map_err(|e| Error::MalformedExport {
        line: start + e.line,
        reason: e.reason,
    })?;
    let defs = lib
        .layout(db.pointer_size())
        .map_err(|reason| Error::MalformedExport {
            line: start,
            reason,
        })?;
    for (name, def) in defs {
        db.define_type(&name, def);
    }
    Ok(())
}

fn finish_function(db: &mut AnalysisDatabase, p: PendingFunction) -> Result<()> {
    let nvars = p.variables.len();
    for e in p.il.exprs() {
        let var = match p.il.kind(e) {
            ExprKind::Var(v) | ExprKind::VarInit { dest: v, .. } => v.var,
            _ => continue,
        };
        if var.0 >= nvars {
            return Err(Error::MalformedExport {
                line: p.line,
                reason: format!(
                    "function {} refers to undeclared variable {}",
                    p.name, var.0
                ),
            });
        }
    }
    db.add_function(&p.name, p.bounds, p.return_type, p.variables, p.il);
    Ok(())
}

fn parse_u64(s: &str) -> Option<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.chars()
        .tuples()
        .map(|(hi, lo)| Some((hi.to_digit(16)? * 16 + lo.to_digit(16)?) as u8))
        .collect()
}

fn tokenize(s: &str) -> Vec<String> {
    s.replace('(', " ( ")
        .replace(')', " ) ")
        .split_whitespace()
        .map(|t| t.to_owned())
        .collect()
}

type Tokens = std::iter::Peekable<std::vec::IntoIter<String>>;

fn expect(tokens: &mut Tokens, tok: &str) -> std::result::Result<(), String> {
    match tokens.next() {
        Some(t) if t == tok => Ok(()),
        Some(t) => Err(format!("expected `{}`, got `{}`", tok, t)),
        None => Err(format!("expected `{}`, got end of line", tok)),
    }
}

fn number(tokens: &mut Tokens) -> std::result::Result<u64, String> {
    let t = tokens.next().ok_or("expected a number")?;
    parse_u64(&t).ok_or_else(|| format!("expected a number, got `{}`", t))
}

fn var_literal(tokens: &mut Tokens) -> std::result::Result<SsaVariable, String> {
    expect(tokens, "(")?;
    expect(tokens, "var")?;
    let v = SsaVariable::new(number(tokens)? as usize, number(tokens)? as usize);
    expect(tokens, ")")?;
    Ok(v)
}

/// Parse a sub-expression, adding it to the arena
fn parse_expr(
    tokens: &mut Tokens,
    il: &mut FunctionIl,
    addr: u64,
) -> std::result::Result<ExprId, String> {
    let kind = parse_kind(tokens, il, addr)?;
    Ok(il.push(kind, addr))
}

/// Parse the operands of a variadic operator up to its closing parenthesis
fn parse_rest(
    tokens: &mut Tokens,
    il: &mut FunctionIl,
    addr: u64,
) -> std::result::Result<Vec<ExprId>, String> {
    let mut res = vec![];
    while tokens.peek().map(|t| t.as_str()) != Some(")") {
        if tokens.peek().is_none() {
            return Err("unbalanced parentheses".into());
        }
        res.push(parse_expr(tokens, il, addr)?);
    }
    Ok(res)
}

/// Parse an expression, adding its sub-expressions (but not itself) to the arena
fn parse_kind(
    tokens: &mut Tokens,
    il: &mut FunctionIl,
    addr: u64,
) -> std::result::Result<ExprKind, String> {
    expect(tokens, "(")?;
    let op = tokens.next().ok_or("expected an operator")?;
    let kind = match op.as_str() {
        "var" => ExprKind::Var(SsaVariable::new(
            number(tokens)? as usize,
            number(tokens)? as usize,
        )),
        "const" => ExprKind::Const(number(tokens)?),
        "addr_of" => ExprKind::AddressOf(parse_expr(tokens, il, addr)?),
        "deref" => ExprKind::Deref(parse_expr(tokens, il, addr)?),
        "field" => {
            let src = parse_expr(tokens, il, addr)?;
            ExprKind::DerefField {
                src,
                offset: number(tokens)?,
                field: None,
            }
        }
        "call" => {
            let dest = parse_expr(tokens, il, addr)?;
            ExprKind::Call {
                dest,
                params: parse_rest(tokens, il, addr)?,
            }
        }
        "init" => {
            let dest = var_literal(tokens)?;
            ExprKind::VarInit {
                dest,
                src: parse_expr(tokens, il, addr)?,
            }
        }
        "assign" => {
            let dest = parse_expr(tokens, il, addr)?;
            if il.as_var(dest).is_none() {
                return Err("assignment destination must be a variable".into());
            }
            ExprKind::Assign {
                dest,
                src: parse_expr(tokens, il, addr)?,
            }
        }
        "store" => {
            let dest = parse_expr(tokens, il, addr)?;
            ExprKind::AssignMem {
                dest,
                src: parse_expr(tokens, il, addr)?,
            }
        }
        "ret" => ExprKind::Return(parse_rest(tokens, il, addr)?),
        "op" => {
            let name = tokens.next().ok_or("expected an operation name")?;
            ExprKind::Unhandled {
                op: name,
                operands: parse_rest(tokens, il, addr)?,
            }
        }
        o => return Err(format!("unknown operator `{}`", o)),
    };
    expect(tokens, ")")?;
    Ok(kind)
}
