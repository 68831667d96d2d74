//! Argument surface of the `fv-host` binary.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "fv-host", version, about = "Farview host service")]
pub struct HostArgs {
    /// Import settings from PATH and exit
    #[arg(long, value_name = "PATH")]
    pub import: Option<PathBuf>,

    /// Export settings to PATH and exit
    #[arg(long, value_name = "PATH")]
    pub export: Option<PathBuf>,

    /// Suppress warnings, for scripted use
    #[arg(long)]
    pub silent: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_parse() {
        HostArgs::command().debug_assert();
        let args = HostArgs::parse_from(["fv-host", "--import", "/tmp/settings.json", "--silent"]);
        assert_eq!(args.import, Some(PathBuf::from("/tmp/settings.json")));
        assert!(args.export.is_none());
        assert!(args.silent);
    }

    #[test]
    fn import_and_export_can_be_given_together() {
        // The conflict is a runtime policy with its own message and exit
        // code, not a clap rejection.
        let args = HostArgs::parse_from(["fv-host", "--import", "a", "--export", "b"]);
        assert!(args.import.is_some() && args.export.is_some());
    }
}
