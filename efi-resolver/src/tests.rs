use std::cell::Cell;
use std::sync::atomic::AtomicBool;

use crate::database::AnalysisDatabase;
use crate::entry_point::retype_entry;
use crate::error::Error;
use crate::exported_lifter::lift_from;
use crate::host::{AnalysisHost, FunctionId};
use crate::il::VariableId;
use crate::pipeline::{
    import_platform_types, resolve_efi, Cancellation, NeverCancelled, PassStatus,
    ResolutionReport,
};
use crate::propagation::{propagate, Seed, TrackedTypes};
use crate::protocols::{find_dispatch_sites, resolve_idiom, DispatchIdiom};
use crate::registry::Registry;
use crate::serialize::serialize;
use crate::trace::{Location, Trace};
use crate::types::Type;

const LOADED_IMAGE_GUID: [u8; 16] = [
    0xa1, 0x31, 0x1b, 0x5b, 0x62, 0x95, 0xd2, 0x11, 0x8e, 0x3f, 0x00, 0xa0, 0xc9, 0x69, 0x72, 0x3b,
];
const SIMPLE_TEXT_OUT_GUID: [u8; 16] = [
    0xc2, 0x77, 0x74, 0x38, 0xc7, 0x69, 0xd2, 0x11, 0x8e, 0x39, 0x00, 0xa0, 0xc9, 0x69, 0x72, 0x3b,
];

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// An exported database of a tiny EFI binary: code at `0x1000`, data at `0x3000` holding the
/// given GUIDs back to back (followed by 0x40 zero bytes).
fn export(platform: &str, guids: &[[u8; 16]], symbols: &str, functions: &str) -> String {
    let mut data: Vec<u8> = guids.iter().flatten().cloned().collect();
    data.extend([0u8; 0x40]);
    format!(
        "PROGRAM\nname sample.efi\nplatform {}\npointer_size 8\nentry 0x1000\n\n\
         SEGMENTS\n0x1000 r-x {}\n0x3000 rw- {}\n\n\
         SYMBOLS\n{}\n\n\
         FUNCTIONS\n{}",
        platform,
        hex(&[0x90; 0x400]),
        hex(&data),
        symbols,
        functions
    )
}

fn lift(platform: &str, guids: &[[u8; 16]], symbols: &str, functions: &str) -> AnalysisDatabase {
    lift_from(&export(platform, guids, symbols, functions)).unwrap()
}

fn run(db: &mut AnalysisDatabase) -> (ResolutionReport, Trace) {
    let mut trace = Trace::new();
    let report = resolve_efi(db, Registry::load().unwrap(), &NeverCancelled, &mut trace).unwrap();
    (report, trace)
}

fn var(db: &AnalysisDatabase, f: FunctionId, v: usize) -> (String, Type) {
    let vi = db.variable(f, VariableId(v)).unwrap();
    (vi.name, vi.ty)
}

fn ptr(name: &str) -> Type {
    Type::named(name).pointer()
}

fn func(db: &AnalysisDatabase, name: &str) -> FunctionId {
    db.function_by_name(name).unwrap()
}

const SERVICES_FLOW: &str = "\
FUNCTION 0x1000 0x1040 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
LOCAL rax_1 void*
0x1004 (init (var 2 1) (field (var 1 0) 0x60))
0x1008 (store (deref (const 0x3000)) (var 2 1))
0x100c (call (const 0x1100) (var 0 0) (var 1 0))
0x1010 (ret (const 0))
FUNCTION 0x1100 0x1140 sub_1100
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
LOCAL rax_1 void*
0x1104 (init (var 2 1) (field (var 1 0) 0x58))
0x1108 (store (deref (const 0x3008)) (var 2 1))
0x110c (ret (const 0))
";

#[test]
fn services_flow_from_entry_to_globals_and_callees() {
    let mut db = lift("efi-x86_64", &[], "", SERVICES_FLOW);
    let (report, trace) = run(&mut db);
    assert_eq!(report.status, PassStatus::Completed);

    let entry = func(&db, "ModuleEntryPoint");
    assert_eq!(report.entry, Some(entry));
    assert_eq!(db.function_record(entry).return_type, Type::named("EFI_STATUS"));
    assert_eq!(
        var(&db, entry, 0),
        ("ImageHandle".into(), Type::named("EFI_HANDLE"))
    );
    assert_eq!(
        var(&db, entry, 1),
        ("SystemTable".into(), ptr("EFI_SYSTEM_TABLE"))
    );
    assert_eq!(
        var(&db, entry, 2),
        ("BootServices".into(), ptr("EFI_BOOT_SERVICES"))
    );
    assert_eq!(db.data_variable_at(0x3000), Some(ptr("EFI_BOOT_SERVICES")));
    assert_eq!(db.symbol_at(0x3000).as_deref(), Some("BootServices"));

    let callee = func(&db, "sub_1100");
    // Only tracked types flow across calls
    assert_eq!(var(&db, callee, 0), ("arg1".into(), Type::Void.pointer()));
    assert_eq!(
        var(&db, callee, 1),
        ("SystemTable".into(), ptr("EFI_SYSTEM_TABLE"))
    );
    assert_eq!(
        var(&db, callee, 2),
        ("RuntimeServices".into(), ptr("EFI_RUNTIME_SERVICES"))
    );
    assert_eq!(db.data_variable_at(0x3008), Some(ptr("EFI_RUNTIME_SERVICES")));
    assert_eq!(db.symbol_at(0x3008).as_deref(), Some("RuntimeServices"));

    assert!(trace.events().iter().any(|e| e.cause == "call argument"
        && e.to
            == Location::Variable {
                function: "sub_1100".into(),
                variable: "SystemTable".into()
            }));
    assert!(trace.generate_dot().contains("global store"));
}

#[test]
fn existing_names_and_tracked_types_are_kept() {
    let mut db = lift_from(&format!(
        "{}\nDATA_VARIABLES\n0x3000 EFI_RUNTIME_SERVICES*\n",
        export("efi-x86_64", &[], "0x3000 gRT\n0x3008 gMyRT", SERVICES_FLOW)
    ))
    .unwrap();
    run(&mut db);
    // Conflicting store of boot services into a runtime services global is ignored
    assert_eq!(db.data_variable_at(0x3000), Some(ptr("EFI_RUNTIME_SERVICES")));
    assert_eq!(db.symbol_at(0x3000).as_deref(), Some("gRT"));
    // Typed, but the existing name stays
    assert_eq!(db.data_variable_at(0x3008), Some(ptr("EFI_RUNTIME_SERVICES")));
    assert_eq!(db.symbol_at(0x3008).as_deref(), Some("gMyRT"));
}

#[test]
fn well_known_globals_are_typed_by_name() {
    let functions = "\
FUNCTION 0x1000 0x1010 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
0x1004 (ret (const 0))
";
    let mut db = lift(
        "efi-x86_64",
        &[],
        "0x3000 EfiBS\n0x3008 EfiConOut\n0x3010 gSomethingElse",
        functions,
    );
    run(&mut db);
    assert_eq!(db.data_variable_at(0x3000), Some(ptr("EFI_BOOT_SERVICES")));
    assert_eq!(
        db.data_variable_at(0x3008),
        Some(ptr("EFI_SIMPLE_TEXT_OUTPUT_PROTOCOL"))
    );
    assert_eq!(db.symbol_at(0x3000).as_deref(), Some("EfiBS"));
    assert_eq!(db.data_variable_at(0x3010), None);
}

const LOCATE_LOADED_IMAGE: &str = "\
FUNCTION 0x1000 0x1080 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
LOCAL bs void*
LOCAL iface void*
LOCAL st void*
0x1004 (init (var 2 1) (field (var 1 0) 0x60))
0x1008 (call (field (var 2 1) 0x140) (addr_of (deref (const 0x3000))) (const 0) (addr_of (var 3 0)))
0x100c (init (var 4 1) (field (var 3 1) 0x10))
0x1010 (call (const 0x1100) (var 4 1))
0x1014 (ret (const 0))
FUNCTION 0x1100 0x1140 sub_1100
RETURN ?
PARAM arg1 void*
LOCAL rax_1 void*
0x1104 (init (var 1 1) (field (var 0 0) 0x60))
0x1108 (ret (const 0))
";

#[test]
fn located_protocol_interface_is_typed_and_followed() {
    let mut db = lift("efi-x86_64", &[LOADED_IMAGE_GUID], "", LOCATE_LOADED_IMAGE);
    let (report, _) = run(&mut db);
    assert_eq!(report.status, PassStatus::Completed);
    assert_eq!(report.sites_resolved, 1);
    assert!(report.rounds >= 1);
    assert_eq!(report.guids_annotated, 1);

    assert_eq!(
        db.symbol_at(0x3000).as_deref(),
        Some("gEfiLoadedImageProtocolGuid")
    );
    assert_eq!(db.data_variable_at(0x3000), Some(Type::named("EFI_GUID")));

    let entry = func(&db, "ModuleEntryPoint");
    assert_eq!(
        var(&db, entry, 3),
        (
            "LoadedImageProtocol".into(),
            ptr("EFI_LOADED_IMAGE_PROTOCOL")
        )
    );
    // Fields of the located interface are followed, and from there into callees
    assert_eq!(
        var(&db, entry, 4),
        ("SystemTable".into(), ptr("EFI_SYSTEM_TABLE"))
    );
    let callee = func(&db, "sub_1100");
    assert_eq!(
        var(&db, callee, 0),
        ("SystemTable".into(), ptr("EFI_SYSTEM_TABLE"))
    );
    assert_eq!(
        var(&db, callee, 1),
        ("BootServices".into(), ptr("EFI_BOOT_SERVICES"))
    );
}

#[test]
fn resolution_is_idempotent() {
    let mut db = lift("efi-x86_64", &[LOADED_IMAGE_GUID], "", LOCATE_LOADED_IMAGE);
    run(&mut db);
    let first = serialize(&db);
    let (report, trace) = run(&mut db);
    assert_eq!(serialize(&db), first);
    assert_eq!(report.guids_annotated, 0);
    assert_eq!(report.types_propagated, 0);
    assert_eq!(report.types_imported, 0);
    assert_eq!(report.rounds, 1);
    // Only the entry point is re-stated
    assert!(trace.events().iter().all(|e| e.cause == "entry point"));

    // And the serialized form lifts back to the same thing
    let relifted = lift_from(&first).unwrap();
    assert_eq!(serialize(&relifted), first);
}

#[test]
fn single_bit_guid_mismatch_resolves_nothing() {
    let mut guid = LOADED_IMAGE_GUID;
    guid[15] ^= 0x01;
    let mut db = lift("efi-x86_64", &[guid], "", LOCATE_LOADED_IMAGE);
    let (report, _) = run(&mut db);
    assert_eq!(report.sites_resolved, 0);
    assert_eq!(report.guids_annotated, 0);
    assert_eq!(db.symbol_at(0x3000), None);
    let entry = func(&db, "ModuleEntryPoint");
    assert_eq!(var(&db, entry, 3), ("iface".into(), Type::Void.pointer()));
}

const HANDLE_AND_OPEN: &str = "\
FUNCTION 0x1000 0x1080 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
LOCAL bs void*
LOCAL iface void*
0x1004 (init (var 2 1) (field (var 1 0) 0x60))
0x1008 (call (field (var 2 1) 0x98) (var 0 0) (const 0x3000) (addr_of (var 3 0)))
0x100c (call (field (var 2 1) 0x118) (var 0 0) (addr_of (deref (const 0x3010))) (addr_of (deref (const 0x3020))) (var 0 0) (const 0) (const 1))
0x1010 (ret (const 0))
";

/// Platform types imported and the entry point typed, nothing propagated yet
fn entry_typed(functions: &str) -> (AnalysisDatabase, TrackedTypes, Option<FunctionId>) {
    let registry = Registry::load().unwrap();
    let mut db = lift(
        "efi-x86_64",
        &[LOADED_IMAGE_GUID, SIMPLE_TEXT_OUT_GUID],
        "",
        functions,
    );
    import_platform_types(&mut db, registry).unwrap();
    let entry = retype_entry(&mut db, &mut Trace::new()).unwrap();
    (db, TrackedTypes::new(registry), entry)
}

/// Everything up to, but excluding, protocol resolution; GUIDs are not scanned for
fn prepared(functions: &str) -> (AnalysisDatabase, TrackedTypes) {
    let (mut db, tracked, entry) = entry_typed(functions);
    propagate(
        &mut db,
        &tracked,
        entry.map(Seed::Function),
        &NeverCancelled,
        &mut Trace::new(),
    );
    (db, tracked)
}

/// Reports cancellation once it has been polled `n` times
struct CancelAfter(Cell<usize>);

impl CancelAfter {
    fn new(n: usize) -> Self {
        Self(Cell::new(n))
    }
}

impl Cancellation for CancelAfter {
    fn is_cancelled(&self) -> bool {
        match self.0.get() {
            0 => true,
            n => {
                self.0.set(n - 1);
                false
            }
        }
    }
}

#[test]
fn handle_and_open_protocol_sites() {
    let registry = Registry::load().unwrap();
    let (mut db, tracked) = prepared(HANDLE_AND_OPEN);
    assert_eq!(find_dispatch_sites(&mut db, DispatchIdiom::HandleProtocol).len(), 1);
    assert_eq!(find_dispatch_sites(&mut db, DispatchIdiom::OpenProtocol).len(), 1);
    assert_eq!(find_dispatch_sites(&mut db, DispatchIdiom::LocateProtocol).len(), 0);

    let mut trace = Trace::new();
    let handle = resolve_idiom(
        &mut db,
        registry,
        &tracked,
        DispatchIdiom::HandleProtocol,
        &NeverCancelled,
        &mut trace,
    );
    assert_eq!(handle.resolved, 1);
    assert_eq!(handle.status, PassStatus::Completed);
    let entry = func(&db, "ModuleEntryPoint");
    assert_eq!(
        handle.seeds,
        vec![Seed::Local {
            function: entry,
            var: VariableId(3)
        }]
    );
    assert_eq!(
        db.symbol_at(0x3000).as_deref(),
        Some("gEfiLoadedImageProtocolGuid")
    );
    assert_eq!(db.data_variable_at(0x3000), Some(Type::named("EFI_GUID")));
    assert_eq!(
        var(&db, entry, 3).1,
        ptr("EFI_LOADED_IMAGE_PROTOCOL")
    );

    let open = resolve_idiom(
        &mut db,
        registry,
        &tracked,
        DispatchIdiom::OpenProtocol,
        &NeverCancelled,
        &mut trace,
    );
    assert_eq!(open.resolved, 1);
    assert!(open.seeds.is_empty());
    assert_eq!(
        db.symbol_at(0x3010).as_deref(),
        Some("gEfiSimpleTextOutProtocolGuid")
    );
    assert_eq!(
        db.data_variable_at(0x3020),
        Some(ptr("EFI_SIMPLE_TEXT_OUTPUT_PROTOCOL"))
    );
    assert_eq!(
        db.symbol_at(0x3020).as_deref(),
        Some("SimpleTextOutputProtocol")
    );
    assert!(trace.events().iter().any(|e| matches!(
        e.from,
        Some(Location::CallSite {
            address: 0x100c,
            ..
        })
    )));

    // A second resolution changes nothing
    let again = resolve_idiom(
        &mut db,
        registry,
        &tracked,
        DispatchIdiom::OpenProtocol,
        &NeverCancelled,
        &mut trace,
    );
    assert_eq!(again.changes, 0);
}

#[test]
fn interface_pointer_passed_through_a_parameter() {
    let functions = "\
FUNCTION 0x1000 0x1040 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
LOCAL bs void*
0x1004 (init (var 2 1) (field (var 1 0) 0x60))
0x1008 (call (const 0x1100) (var 2 1) (const 0))
0x100c (ret (const 0))
FUNCTION 0x1100 0x1140 GetInterface
RETURN ?
PARAM arg1 void*
PARAM arg2 void**
0x1104 (call (field (var 0 0) 0x140) (const 0x3000) (const 0) (var 1 0))
0x1108 (ret (const 0))
";
    let (mut db, tracked) = prepared(functions);
    let f = func(&db, "GetInterface");
    assert_eq!(var(&db, f, 0).1, ptr("EFI_BOOT_SERVICES"));

    let out = resolve_idiom(
        &mut db,
        Registry::load().unwrap(),
        &tracked,
        DispatchIdiom::LocateProtocol,
        &NeverCancelled,
        &mut Trace::new(),
    );
    assert_eq!(out.seeds, vec![Seed::Function(f)]);
    assert_eq!(
        var(&db, f, 1),
        (
            "LoadedImageProtocol".into(),
            ptr("EFI_LOADED_IMAGE_PROTOCOL").pointer()
        )
    );
}

#[test]
fn non_efi_binaries_are_rejected_untouched() {
    let mut db = lift("windows-x86_64", &[LOADED_IMAGE_GUID], "", LOCATE_LOADED_IMAGE);
    let before = serialize(&db);
    let err = resolve_efi(
        &mut db,
        Registry::load().unwrap(),
        &NeverCancelled,
        &mut Trace::new(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::PlatformMismatch { .. }));
    assert_eq!(serialize(&db), before);
}

#[test]
fn mutual_recursion_terminates() {
    let functions = "\
FUNCTION 0x1000 0x1040 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
0x1004 (call (const 0x1100) (var 1 0))
0x1008 (ret (const 0))
FUNCTION 0x1100 0x1140 ping
RETURN ?
PARAM arg1 void*
0x1104 (call (const 0x1200) (var 0 0))
0x1108 (ret (const 0))
FUNCTION 0x1200 0x1240 pong
RETURN ?
PARAM arg1 void*
0x1204 (call (const 0x1100) (var 0 0))
0x1208 (call (const 0x1200) (var 0 0))
0x120c (ret (const 0))
";
    let mut db = lift("efi-x86_64", &[], "", functions);
    let (report, _) = run(&mut db);
    assert_eq!(report.status, PassStatus::Completed);
    for name in ["ping", "pong"] {
        assert_eq!(
            var(&db, func(&db, name), 0),
            ("SystemTable".into(), ptr("EFI_SYSTEM_TABLE"))
        );
    }
}

#[test]
fn self_referential_interfaces_terminate() {
    let registry = Registry::parse(
        ("guids", ""),
        (
            "protocols",
            "///@protocol {0x11111111, 0x2222, 0x3333, {0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB}}\n\
             ///@binding gEfiListProtocolGuid {0x11111111, 0x2222, 0x3333, {0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB}}\n\
             struct EFI_LIST_PROTOCOL\n",
        ),
    )
    .unwrap();
    let text = "\
PROGRAM
name list.efi
platform efi-x86_64
pointer_size 8

TYPES
struct EFI_LIST_PROTOCOL
\tEFI_LIST_PROTOCOL* Next

FUNCTIONS
FUNCTION 0x1000 0x1040 walk
RETURN ?
PARAM list EFI_LIST_PROTOCOL*
LOCAL next void*
0x1004 (init (var 1 1) (field (var 0 0) 0x0))
0x1008 (init (var 1 2) (field (var 1 1) 0x0))
0x100c (assign (var 1 1) (var 1 2))
0x1010 (call (const 0x1000) (var 1 2))
0x1014 (ret (const 0))
";
    let mut db = lift_from(text).unwrap();
    let walk = func(&db, "walk");
    let tracked = TrackedTypes::new(&registry);
    let out = propagate(
        &mut db,
        &tracked,
        [Seed::Function(walk)],
        &NeverCancelled,
        &mut Trace::new(),
    );
    assert_eq!(out.status, PassStatus::Completed);
    assert_eq!(out.changes, 1);
    assert_eq!(
        var(&db, walk, 1),
        ("ListProtocol".into(), ptr("EFI_LIST_PROTOCOL"))
    );
}

#[test]
fn cancellation_keeps_completed_work() {
    let mut db = lift("efi-x86_64", &[LOADED_IMAGE_GUID], "", LOCATE_LOADED_IMAGE);
    let cancel = AtomicBool::new(true);
    let report = resolve_efi(
        &mut db,
        Registry::load().unwrap(),
        &cancel,
        &mut Trace::new(),
    )
    .unwrap();
    assert_eq!(report.status, PassStatus::Cancelled);
    // The entry point is typed before the first cancellation check
    let entry = func(&db, "ModuleEntryPoint");
    assert_eq!(var(&db, entry, 1).1, ptr("EFI_SYSTEM_TABLE"));
    assert_eq!(db.symbol_at(0x3000), None);
    assert_eq!(var(&db, entry, 2).1, Type::Void.pointer());
}

#[test]
fn field_stored_straight_to_a_global() {
    let functions = "\
FUNCTION 0x1000 0x1040 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
LOCAL unused void*
0x1004 (store (deref (const 0x3000)) (field (var 1 0) 0x60))
0x1008 (ret (const 0))
";
    let mut db = lift("efi-x86_64", &[], "", functions);
    let (report, trace) = run(&mut db);
    assert_eq!(db.data_variable_at(0x3000), Some(ptr("EFI_BOOT_SERVICES")));
    assert_eq!(db.symbol_at(0x3000).as_deref(), Some("BootServices"));
    let entry = func(&db, "ModuleEntryPoint");
    assert_eq!(var(&db, entry, 2), ("unused".into(), Type::Void.pointer()));
    assert_eq!(report.types_propagated, 1);
    assert!(trace.events().iter().any(|e| e.cause == "field store"
        && e.from
            == Some(Location::Field {
                struct_name: "EFI_SYSTEM_TABLE".into(),
                member: "BootServices".into()
            })));
}

#[test]
fn runtime_computed_guid_argument_is_left_alone() {
    let functions = "\
FUNCTION 0x1000 0x1080 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
LOCAL bs void*
LOCAL iface void*
LOCAL guid void*
0x1004 (init (var 2 1) (field (var 1 0) 0x60))
0x1008 (init (var 4 1) (op add (var 0 0) (const 0x10)))
0x100c (call (field (var 2 1) 0x140) (var 4 1) (const 0) (addr_of (var 3 0)))
0x1010 (ret (const 0))
";
    let mut db = lift("efi-x86_64", &[LOADED_IMAGE_GUID], "", functions);
    let (report, _) = run(&mut db);
    assert_eq!(report.status, PassStatus::Completed);
    assert_eq!(report.sites_resolved, 0);
    let entry = func(&db, "ModuleEntryPoint");
    assert_eq!(var(&db, entry, 3), ("iface".into(), Type::Void.pointer()));
    assert_eq!(find_dispatch_sites(&mut db, DispatchIdiom::LocateProtocol).len(), 1);
}

#[test]
fn interface_returned_through_a_pointer_to_a_local() {
    let functions = "\
FUNCTION 0x1000 0x1080 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
LOCAL bs void*
LOCAL iface void*
LOCAL out void*
0x1004 (init (var 2 1) (field (var 1 0) 0x60))
0x1008 (init (var 4 1) (addr_of (var 3 0)))
0x100c (call (field (var 2 1) 0x140) (addr_of (deref (const 0x3000))) (const 0) (var 4 1))
0x1010 (call (const 0x1100) (var 4 1))
0x1014 (ret (const 0))
FUNCTION 0x1100 0x1140 sub_1100
RETURN ?
PARAM arg1 void*
0x1104 (ret (const 0))
";
    let mut db = lift("efi-x86_64", &[LOADED_IMAGE_GUID], "", functions);
    let (report, _) = run(&mut db);
    assert_eq!(report.sites_resolved, 1);

    let entry = func(&db, "ModuleEntryPoint");
    let interface = ptr("EFI_LOADED_IMAGE_PROTOCOL");
    assert_eq!(
        var(&db, entry, 3),
        ("LoadedImageProtocol".into(), interface.clone())
    );
    assert_eq!(
        var(&db, entry, 4),
        ("LoadedImageProtocol".into(), interface.clone().pointer())
    );
    // The pointer to the local is forwarded to a callee
    assert_eq!(
        var(&db, func(&db, "sub_1100"), 0),
        ("LoadedImageProtocol".into(), interface.pointer())
    );
}

#[test]
fn interface_returned_through_a_copied_global_address() {
    let functions = "\
FUNCTION 0x1000 0x1080 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
LOCAL bs void*
LOCAL out void*
0x1004 (init (var 2 1) (field (var 1 0) 0x60))
0x1008 (init (var 3 1) (addr_of (deref (const 0x3020))))
0x100c (call (field (var 2 1) 0x140) (addr_of (deref (const 0x3000))) (const 0) (var 3 1))
0x1010 (ret (const 0))
";
    let mut db = lift("efi-x86_64", &[LOADED_IMAGE_GUID], "", functions);
    run(&mut db);
    assert_eq!(
        db.data_variable_at(0x3020),
        Some(ptr("EFI_LOADED_IMAGE_PROTOCOL"))
    );
    assert_eq!(
        db.symbol_at(0x3020).as_deref(),
        Some("LoadedImageProtocol")
    );
    let entry = func(&db, "ModuleEntryPoint");
    assert_eq!(var(&db, entry, 3), ("out".into(), Type::Void.pointer()));
}

#[test]
fn local_keeps_its_own_tracked_type_downstream() {
    let functions = "\
FUNCTION 0x1000 0x1040 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
LOCAL rt EFI_RUNTIME_SERVICES*
0x1004 (init (var 2 1) (field (var 1 0) 0x60))
0x1008 (call (const 0x1100) (var 2 1))
0x100c (ret (const 0))
FUNCTION 0x1100 0x1140 sub_1100
RETURN ?
PARAM arg1 void*
0x1104 (ret (const 0))
";
    let mut db = lift("efi-x86_64", &[], "", functions);
    run(&mut db);
    let entry = func(&db, "ModuleEntryPoint");
    assert_eq!(
        var(&db, entry, 2),
        ("rt".into(), ptr("EFI_RUNTIME_SERVICES"))
    );
    assert_eq!(
        var(&db, func(&db, "sub_1100"), 0),
        ("RuntimeServices".into(), ptr("EFI_RUNTIME_SERVICES"))
    );
}

#[test]
fn each_idiom_is_propagated_before_the_next() {
    // The OpenProtocol receiver is only reachable through the HandleProtocol result
    let functions = "\
FUNCTION 0x1000 0x1080 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
LOCAL bs void*
LOCAL image void*
LOCAL st void*
LOCAL bs2 void*
0x1004 (init (var 2 1) (field (var 1 0) 0x60))
0x1008 (call (field (var 2 1) 0x98) (var 0 0) (addr_of (deref (const 0x3000))) (addr_of (var 3 0)))
0x100c (init (var 4 1) (field (var 3 1) 0x10))
0x1010 (init (var 5 1) (field (var 4 1) 0x60))
0x1014 (call (field (var 5 1) 0x118) (var 0 0) (addr_of (deref (const 0x3010))) (addr_of (deref (const 0x3020))) (var 0 0) (const 0) (const 1))
0x1018 (ret (const 0))
";
    let mut db = lift(
        "efi-x86_64",
        &[LOADED_IMAGE_GUID, SIMPLE_TEXT_OUT_GUID],
        "",
        functions,
    );
    let (report, _) = run(&mut db);
    // Both sites are resolved in the first round; the second only confirms it
    assert_eq!(report.rounds, 2);
    assert_eq!(report.sites_resolved, 2);
    let entry = func(&db, "ModuleEntryPoint");
    assert_eq!(var(&db, entry, 5).1, ptr("EFI_BOOT_SERVICES"));
    assert_eq!(
        db.data_variable_at(0x3020),
        Some(ptr("EFI_SIMPLE_TEXT_OUTPUT_PROTOCOL"))
    );
}

#[test]
fn cancelled_propagation_keeps_earlier_retypes() {
    let (mut db, tracked, entry) = entry_typed(SERVICES_FLOW);
    // The entry function is visited, its callee is not
    let out = propagate(
        &mut db,
        &tracked,
        entry.map(Seed::Function),
        &CancelAfter::new(1),
        &mut Trace::new(),
    );
    assert_eq!(out.status, PassStatus::Cancelled);
    assert!(out.changes > 0);

    let entry = func(&db, "ModuleEntryPoint");
    assert_eq!(var(&db, entry, 2).1, ptr("EFI_BOOT_SERVICES"));
    assert_eq!(db.data_variable_at(0x3000), Some(ptr("EFI_BOOT_SERVICES")));
    let callee = func(&db, "sub_1100");
    assert_eq!(
        var(&db, callee, 1),
        ("SystemTable".into(), ptr("EFI_SYSTEM_TABLE"))
    );
    assert_eq!(var(&db, callee, 2), ("rax_1".into(), Type::Void.pointer()));
    assert_eq!(db.data_variable_at(0x3008), None);
}

#[test]
fn cancelled_resolver_keeps_earlier_sites() {
    let functions = "\
FUNCTION 0x1000 0x1080 _ModuleEntryPoint
RETURN ?
PARAM arg1 void*
PARAM arg2 void*
LOCAL bs void*
LOCAL iface void*
0x1004 (init (var 2 1) (field (var 1 0) 0x60))
0x1008 (call (field (var 2 1) 0x140) (addr_of (deref (const 0x3000))) (const 0) (addr_of (var 3 0)))
0x100c (call (field (var 2 1) 0x140) (addr_of (deref (const 0x3010))) (const 0) (addr_of (deref (const 0x3020))))
0x1010 (ret (const 0))
";
    let (mut db, tracked) = prepared(functions);
    let out = resolve_idiom(
        &mut db,
        Registry::load().unwrap(),
        &tracked,
        DispatchIdiom::LocateProtocol,
        &CancelAfter::new(1),
        &mut Trace::new(),
    );
    assert_eq!(out.status, PassStatus::Cancelled);
    assert_eq!(out.resolved, 1);
    let entry = func(&db, "ModuleEntryPoint");
    assert_eq!(
        out.seeds,
        vec![Seed::Local {
            function: entry,
            var: VariableId(3)
        }]
    );
    assert_eq!(var(&db, entry, 3).1, ptr("EFI_LOADED_IMAGE_PROTOCOL"));
    assert_eq!(db.data_variable_at(0x3020), None);
    assert_eq!(db.symbol_at(0x3010), None);
}
