use efi_resolver::*;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use efi_resolver::error::{Error, Result};
use efi_resolver::log::*;

/// Recover UEFI interface types in firmware binaries
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Resolve EFI types in an exported analysis database
    Resolve {
        /// Path to the exported database of the binary to resolve
        exported_db: PathBuf,
        /// Path to a GUID definitions file, to use instead of the bundled one
        #[clap(long)]
        guids: Option<PathBuf>,
        /// Path to a protocol bindings file, to use instead of the bundled one
        #[clap(long)]
        protocols: Option<PathBuf>,
        /// Path to write the resolved database to. Printed to stdout if not provided.
        #[clap(long)]
        output: Option<PathBuf>,
        /// Output the flow of types as a GraphViz `.dot` file to the given path
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Path to dump the IL of every function to, after resolution, with derived fields shown
        #[clap(long)]
        dump_il: Option<PathBuf>,
        /// Do not log to the terminal at all, not even critical errors
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Make terminal logging block instead of dropping messages when it cannot keep up
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to write a JSON log to. Errors are still also shown on stderr.
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Verbosity; repeat for more (warn, info, debug, trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak resolution behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<resolver_config::CommandLineResolverConfig>,
    },
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).map_err(|source| Error::Io {
        path: path.to_owned(),
        source,
    })
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_owned(),
        source,
    })
}

#[allow(clippy::too_many_arguments)]
fn resolve(
    exported_db: PathBuf,
    guids: Option<PathBuf>,
    protocols: Option<PathBuf>,
    output: Option<PathBuf>,
    debug_output_graphviz: Option<PathBuf>,
    dump_il: Option<PathBuf>,
) -> Result<()> {
    let loaded;
    let registry = if guids.is_none() && protocols.is_none() {
        registry::Registry::load()?
    } else {
        loaded = registry::Registry::from_files(guids.as_deref(), protocols.as_deref())?;
        &loaded
    };
    debug!("Loaded registry"; "identifiers" => registry.len());

    let mut db = exported_lifter::lift_from(&read_file(&exported_db)?)?;
    let mut trace = trace::Trace::new();
    let report = pipeline::resolve_efi(&mut db, registry, &pipeline::NeverCancelled, &mut trace)?;
    debug!("Report"; "report" => ?report);

    if let Some(path) = dump_il {
        let dump = il::with_SHOW_DERIVED_FIELDS_set(|| {
            db.function_records()
                .map(|r| {
                    let il = r.il();
                    let body: String = il
                        .statements()
                        .map(|s| format!("  {:#x} {}\n", il.node(s).address, il.display(s)))
                        .collect();
                    format!("{} @ {:#x}\n{}", r.name, r.start, body)
                })
                .collect::<Vec<_>>()
                .join("\n")
        });
        write_file(&path, &dump)?;
    }

    if let Some(path) = debug_output_graphviz {
        write_file(&path, &trace.generate_dot())?;
    }

    let serialized = serialize::serialize(&db);
    match output {
        Some(path) => write_file(&path, &serialized)?,
        None => println!("{}", serialized),
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    match args {
        Args::Resolve {
            exported_db,
            guids,
            protocols,
            output,
            debug_output_graphviz,
            dump_il,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let logger = match log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ) {
                Ok(l) => l,
                Err(e) => {
                    eprintln!("Could not set up logging: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let _log_guard = slog_scope::set_global_logger(logger);

            resolver_config::ResolverConfig::initialize(advanced_config);

            match resolve(
                exported_db,
                guids,
                protocols,
                output,
                debug_output_graphviz,
                dump_il,
            ) {
                Ok(()) => {
                    trace!("Done");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    crit!("Resolution failed"; "error" => %e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}
