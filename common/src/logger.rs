use redox_log::{OutputBuilder, RedoxLogger};

/// Configures logging for a single driver.
///
/// Output at or above `output_level` goes to stderr; on Redox, output at or above `file_level`
/// is also kept in `{logfile_base}.log` and `{logfile_base}.ansi.log` of the logging scheme.
/// Returns `false` when a logger was already installed, in which case nothing changes.
#[cfg_attr(not(target_os = "redox"), allow(unused_variables, unused_mut))]
pub fn setup_logging(
    category: &str,
    subcategory: &str,
    logfile_base: &str,
    output_level: log::LevelFilter,
    file_level: log::LevelFilter,
) -> bool {
    let mut logger = RedoxLogger::new().with_output(
        OutputBuilder::stderr()
            .with_filter(output_level)
            .with_ansi_escape_codes()
            .flush_on_newline(true)
            .build(),
    );

    #[cfg(target_os = "redox")]
    for (name, ansi) in [("log", false), ("ansi.log", true)] {
        match OutputBuilder::in_redox_logging_scheme(
            category,
            subcategory,
            format!("{logfile_base}.{name}"),
        ) {
            Ok(b) => {
                let b = if ansi { b.with_ansi_escape_codes() } else { b };
                logger = logger.with_output(b.with_filter(file_level).flush_on_newline(true).build())
            }
            Err(error) => eprintln!("Failed to create {logfile_base}.{name}: {}", error),
        }
    }

    logger.enable().is_ok()
}
