use clap::{Arg, ArgAction, ArgMatches, Command};

pub const ARG_PIN_SHA256: &str = "pin-sha256";
pub const ARG_ALLOW_ANY_CERTIFICATE: &str = "dangerously-allow-any-certificate";

#[derive(Debug, Clone)]
pub struct Options {
    pub fingerprints: Vec<String>,
    pub allow_any: bool,
}

impl Options {
    /// Parse certificate pinning arguments from matches.
    ///
    /// # Errors
    /// Returns an error if arguments are inconsistent.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let fingerprints = matches
            .get_many::<String>(ARG_PIN_SHA256)
            .map(|values| values.cloned().collect())
            .unwrap_or_default();

        Ok(Self {
            fingerprints,
            allow_any: matches.get_flag(ARG_ALLOW_ANY_CERTIFICATE),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PIN_SHA256)
                .long(ARG_PIN_SHA256)
                .help("Pinned SHA-256 fingerprint of the store server certificate (repeatable)")
                .long_help(
                    "Pinned SHA-256 fingerprint of the store server certificate, hex encoded.\n\nRepeat the flag (or comma-separate values in the environment variable) to pin several certificates, e.g. the current one and its announced successor.",
                )
                .env("GARDISTO_PIN_SHA256")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_ALLOW_ANY_CERTIFICATE)
                .long(ARG_ALLOW_ANY_CERTIFICATE)
                .help("Disable certificate pinning and accept any server certificate (development only)")
                .env("GARDISTO_DANGEROUSLY_ALLOW_ANY_CERTIFICATE")
                .action(ArgAction::SetTrue)
                .conflicts_with(ARG_PIN_SHA256),
        )
}
