//! Argument surface of the `fv-router` binary.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "fv-router", version, about = "Farview rendezvous router")]
pub struct RouterArgs {
    #[command(subcommand)]
    pub cmd: Option<RouterCommand>,
}

#[derive(Subcommand, Debug)]
pub enum RouterCommand {
    /// Create the initial configuration: settings file, directory database,
    /// identity keypair, and the default admin user
    CreateConfig,
    /// Generate an identity keypair and print it
    Keygen,
    /// Run the router service (default when no subcommand is given)
    Run,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_parse() {
        RouterArgs::command().debug_assert();
        let args = RouterArgs::parse_from(["fv-router", "keygen"]);
        assert!(matches!(args.cmd, Some(RouterCommand::Keygen)));
        let args = RouterArgs::parse_from(["fv-router"]);
        assert!(args.cmd.is_none());
    }
}
