//! Recovery of UEFI interface types in firmware binaries.
//!
//! Known GUIDs embedded in data are named and typed, the module entry point is given its
//! standard signature, and pointers to the system table, boot/runtime services, and located
//! protocol interfaces are propagated through each function's SSA def-use chains and across
//! calls. See [`pipeline::resolve_efi`] for the full sequence.

pub mod classify;
pub mod constant_folding;
pub mod containers;
pub mod database;
pub mod dynamic_variable;
pub mod entry_point;
pub mod error;
pub mod exported_lifter;
pub mod guid_scanner;
pub mod host;
pub mod il;
pub mod pipeline;
pub mod propagation;
pub mod protocols;
pub mod registry;
pub mod resolver_config;
pub mod serialize;
pub mod ssa;
pub mod trace;
pub mod types;

#[cfg(test)]
mod tests;

pub mod log {
    pub use slog_scope::{crit, debug, error, info, trace, warn};

    /// A key-value pair that is only emitted if the value is present
    pub struct OptionalKV<V: slog::Value>(pub &'static str, pub Option<V>);
    impl<V: slog::Value> slog::KV for OptionalKV<V> {
        fn serialize(
            &self,
            record: &slog::Record,
            serializer: &mut dyn slog::Serializer,
        ) -> slog::Result {
            match &self.1 {
                Some(v) => v.serialize(record, self.0, serializer),
                None => Ok(()),
            }
        }
    }

    /// Duplicates records to an (optional) JSON log file and to the terminal
    pub struct FileAndTermDrain {
        file_drain: Option<slog::Logger>,
        term_drain: slog::Logger,
    }
    impl FileAndTermDrain {
        /// Build the root logger. With a log file, the terminal only shows errors and above.
        pub fn new(
            debug_level: usize,
            disable_terminal_logging: bool,
            force_block: bool,
            path: Option<std::path::PathBuf>,
        ) -> Result<slog::Logger, sloggers::Error> {
            use sloggers::types::{Format, OverflowStrategy, Severity};
            use sloggers::Build;

            let debug_level = match debug_level {
                0 => Severity::Warning,
                1 => Severity::Info,
                2 => Severity::Debug,
                _ => Severity::Trace,
            };

            let term_drain = if disable_terminal_logging {
                sloggers::null::NullLoggerBuilder.build()?
            } else {
                sloggers::terminal::TerminalLoggerBuilder::new()
                    .destination(sloggers::terminal::Destination::Stderr)
                    .level(match &path {
                        None => debug_level,
                        Some(_) => Severity::Error,
                    })
                    .overflow_strategy(if force_block || path.is_none() {
                        OverflowStrategy::Block
                    } else {
                        OverflowStrategy::DropAndReport
                    })
                    .format(Format::Compact)
                    .build()?
            };

            let file_drain = match path {
                Some(path) => Some(
                    sloggers::file::FileLoggerBuilder::new(path)
                        .truncate()
                        .level(debug_level)
                        .overflow_strategy(OverflowStrategy::Block)
                        .format(Format::Json)
                        .build()?,
                ),
                None => None,
            };

            Ok(slog::Logger::root(
                Self {
                    file_drain,
                    term_drain,
                },
                slog::o!(),
            ))
        }
    }
    impl slog::Drain for FileAndTermDrain {
        type Ok = ();
        type Err = slog::Never;
        fn log(
            &self,
            r: &slog::Record<'_>,
            kv: &slog::OwnedKVList,
        ) -> Result<<Self as slog::Drain>::Ok, <Self as slog::Drain>::Err> {
            if let Some(f) = &self.file_drain {
                <slog::Logger as slog::Drain>::log(f, r, kv)?;
            }
            <slog::Logger as slog::Drain>::log(&self.term_drain, r, kv)?;
            Ok(())
        }
    }
}
