//! A global store of flags that can impact resolution.
//!
//! Only a single configuration per process is supported; it is fixed the first time
//! [`CONFIG`](static@CONFIG) is accessed.

use std::sync::Mutex;

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
#[derive(Debug)]
pub struct ResolverConfig {
    /// Scan readable segments for known GUIDs and annotate them.
    pub enable_guid_scan: bool,
    /// After each propagation pass, type the well-known globals (`EfiST`, `EfiBS`, ...) by name.
    pub enable_well_known_globals: bool,
    /// Resolve `HandleProtocol`/`OpenProtocol`/`LocateProtocol` call sites.
    pub enable_protocol_resolution: bool,
    /// Run each protocol resolver exactly once, rather than alternating resolution and
    /// propagation until a round makes no further progress.
    pub single_resolution_round: bool,
    /// Follow SSA definitions of copies when folding a GUID argument to a constant address. When
    /// disabled, only literal constants and address-of-global arguments are recognized.
    pub fold_guid_arguments_through_copies: bool,
    /// Import the bundled EFI type library into hosts that target an EFI platform.
    pub import_platform_types: bool,
}

impl ResolverConfig {
    fn from_initialized() -> Self {
        match INTERNAL_CONFIG_INITIALIZER.lock() {
            Ok(mut init) => init.take().unwrap_or_default(),
            Err(_) => Default::default(),
        }
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`, before anything reads [`CONFIG`](static@CONFIG).
    pub fn initialize(command_line_config: Vec<CommandLineResolverConfig>) {
        if let Ok(mut init) = INTERNAL_CONFIG_INITIALIZER.lock() {
            assert!(init.is_none(), "Performed double initialization");
            *init = Some(command_line_config.into());
        }
        lazy_static::initialize(&CONFIG);
    }
}

lazy_static::lazy_static! {
    /// Internal initialization detail.
    static ref INTERNAL_CONFIG_INITIALIZER: Mutex<Option<ResolverConfig>> = Mutex::new(None);

    /// The global configuration store
    pub static ref CONFIG: ResolverConfig = ResolverConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Resolution configuration parameters
pub enum CommandLineResolverConfig {
    DisableGuidScan,
    DisableWellKnownGlobals,
    DisableProtocolResolution,
    SingleResolutionRound,
    DisableConstantFoldingOfGuidArguments,
    DisableImportOfPlatformTypes,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            enable_guid_scan: true,
            enable_well_known_globals: true,
            enable_protocol_resolution: true,
            single_resolution_round: false,
            fold_guid_arguments_through_copies: true,
            import_platform_types: true,
        }
    }
}

impl From<Vec<CommandLineResolverConfig>> for ResolverConfig {
    fn from(v: Vec<CommandLineResolverConfig>) -> Self {
        use CommandLineResolverConfig::*;
        let mut r = ResolverConfig::default();
        for v in v {
            match v {
                DisableGuidScan => {
                    r.enable_guid_scan = false;
                }
                DisableWellKnownGlobals => {
                    r.enable_well_known_globals = false;
                }
                DisableProtocolResolution => {
                    r.enable_protocol_resolution = false;
                }
                SingleResolutionRound => {
                    r.single_resolution_round = true;
                }
                DisableConstantFoldingOfGuidArguments => {
                    r.fold_guid_arguments_through_copies = false;
                }
                DisableImportOfPlatformTypes => {
                    r.import_platform_types = false;
                }
            }
        }
        r
    }
}
