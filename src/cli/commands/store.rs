use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_STORE_URL: &str = "store-url";
pub const ARG_STORE_TOKEN: &str = "store-token";

#[derive(Debug, Clone)]
pub struct Options {
    pub url: String,
    pub token: SecretString,
}

impl Options {
    /// Parse table-store arguments from matches.
    ///
    /// # Errors
    /// Returns an error if required arguments are missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let read_required = |id: &str| -> anyhow::Result<String> {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
        };

        Ok(Self {
            url: read_required(ARG_STORE_URL)?,
            token: SecretString::from(read_required(ARG_STORE_TOKEN)?),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_STORE_URL)
                .long(ARG_STORE_URL)
                .help("Base URL of the tabular data service (https://host[:port])")
                .env("GARDISTO_STORE_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_STORE_TOKEN)
                .long(ARG_STORE_TOKEN)
                .help("Bearer token for the tabular data service")
                .env("GARDISTO_STORE_TOKEN")
                .required(true),
        )
}
