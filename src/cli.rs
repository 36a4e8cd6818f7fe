use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "healthkit2sqlite",
    about = "Convert an Apple Health export (export.zip, its directory, or export.xml) into SQLite"
)]
pub struct Cli {
    /// Path to the export ZIP, an extracted export directory, or export.xml.
    #[arg(value_name = "EXPORT")]
    pub export: PathBuf,

    /// SQLite database to write to (created if missing).
    #[arg(value_name = "DB_PATH")]
    pub db_path: PathBuf,

    /// Treat EXPORT as a raw export.xml regardless of its name.
    #[arg(long)]
    pub xml: bool,

    /// Do not show the progress bar.
    #[arg(long)]
    pub silent: bool,

    /// Increase log verbosity (-v, -vv). Defaults to INFO.
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Decrease log verbosity (-q, -qq). Defaults to INFO.
    #[arg(short = 'q', long, action = ArgAction::Count, global = true)]
    pub quiet: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::parse_from(["healthkit2sqlite", "export.zip", "out.db", "--silent", "-vv"]);
        assert_eq!(cli.export, PathBuf::from("export.zip"));
        assert_eq!(cli.db_path, PathBuf::from("out.db"));
        assert!(cli.silent);
        assert!(!cli.xml);
        assert_eq!(cli.verbose, 2);
    }
}
