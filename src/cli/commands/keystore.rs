use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_KEYSTORE_URL: &str = "keystore-url";
pub const ARG_KEYSTORE_TOKEN: &str = "keystore-token";
pub const ARG_KEYSTORE_MOUNT: &str = "keystore-mount";
pub const ARG_KEYSTORE_PREFIX: &str = "keystore-prefix";

#[derive(Debug, Clone)]
pub struct Options {
    pub url: String,
    pub token: SecretString,
    pub mount: String,
    pub prefix: String,
}

impl Options {
    /// Parse keystore arguments from matches.
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
            url: read_required(ARG_KEYSTORE_URL)?,
            token: SecretString::from(read_required(ARG_KEYSTORE_TOKEN)?),
            mount: read_required(ARG_KEYSTORE_MOUNT)?,
            prefix: read_required(ARG_KEYSTORE_PREFIX)?,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_KEYSTORE_URL)
                .long(ARG_KEYSTORE_URL)
                .help("Base URL of the secure key-value store (https://host[:port])")
                .env("GARDISTO_KEYSTORE_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_KEYSTORE_TOKEN)
                .long(ARG_KEYSTORE_TOKEN)
                .help("Token for the secure key-value store")
                .env("GARDISTO_KEYSTORE_TOKEN")
                .required(true),
        )
        .arg(
            Arg::new(ARG_KEYSTORE_MOUNT)
                .long(ARG_KEYSTORE_MOUNT)
                .help("KV-v2 mount path for secret material")
                .env("GARDISTO_KEYSTORE_MOUNT")
                .default_value("secret"),
        )
        .arg(
            Arg::new(ARG_KEYSTORE_PREFIX)
                .long(ARG_KEYSTORE_PREFIX)
                .help("Key prefix under the mount for this deployment")
                .env("GARDISTO_KEYSTORE_PREFIX")
                .default_value("gardisto"),
        )
}
