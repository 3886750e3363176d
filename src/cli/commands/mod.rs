pub mod alerts;
pub mod keystore;
pub mod logging;
pub mod pinning;
pub mod security;
pub mod store;

use clap::{
    ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

use self::pinning::{ARG_ALLOW_ANY_CERTIFICATE, ARG_PIN_SHA256};

/// Validate that the transport trust arguments are usable.
///
/// # Errors
/// Returns an error string if no certificate pin is configured and the
/// development escape hatch is not set, or if a pin is not a SHA-256
/// hex fingerprint.
pub fn validate(matches: &clap::ArgMatches) -> Result<(), String> {
    if matches.get_flag(ARG_ALLOW_ANY_CERTIFICATE) {
        return Ok(());
    }

    let mut pins = 0;
    for pin in matches
        .get_many::<String>(ARG_PIN_SHA256)
        .into_iter()
        .flatten()
    {
        let normalized = crate::pinning::normalize_fingerprint(pin);
        if normalized.len() != 64 || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!(
                "Invalid --{ARG_PIN_SHA256}: {pin:?} is not a SHA-256 hex fingerprint"
            ));
        }
        pins += 1;
    }

    if pins == 0 {
        return Err(format!(
            "Missing required argument: --{ARG_PIN_SHA256} (or --{ARG_ALLOW_ANY_CERTIFICATE} for development)"
        ));
    }
    Ok(())
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("gardisto")
        .about("Account security and trust layer")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles);

    let command = store::with_args(command);
    let command = keystore::with_args(command);
    let command = security::with_args(command);
    let command = pinning::with_args(command);
    let command = alerts::with_args(command);
    logging::with_args(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Severity;

    fn sample_pin() -> String {
        "ab".repeat(32)
    }

    // Helper to clear env vars for transport trust validation tests
    fn with_cleared_pinning_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        temp_env::with_vars(
            [
                ("GARDISTO_PIN_SHA256", None::<&str>),
                ("GARDISTO_DANGEROUSLY_ALLOW_ANY_CERTIFICATE", None::<&str>),
            ],
            f,
        )
    }

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "gardisto");
        assert_eq!(
            command.get_about().map(ToString::to_string),
            Some("Account security and trust layer".to_string())
        );
        assert_eq!(
            command.get_version().map(ToString::to_string),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
    }

    #[test]
    fn test_check_required_args_and_defaults() {
        let pin = sample_pin();
        let command = new();
        let matches = command.get_matches_from(vec![
            "gardisto",
            "--store-url",
            "https://store.example.com",
            "--store-token",
            "store-token",
            "--keystore-url",
            "https://vault.example.com:8200",
            "--keystore-token",
            "keystore-token",
            "--pin-sha256",
            &pin,
        ]);

        assert_eq!(
            matches.get_one::<String>(store::ARG_STORE_URL).cloned(),
            Some("https://store.example.com".to_string())
        );
        assert_eq!(
            matches
                .get_one::<String>(keystore::ARG_KEYSTORE_MOUNT)
                .cloned(),
            Some("secret".to_string())
        );
        assert_eq!(
            matches
                .get_one::<String>(keystore::ARG_KEYSTORE_PREFIX)
                .cloned(),
            Some("gardisto".to_string())
        );
        assert_eq!(
            matches
                .get_one::<u32>(security::ARG_MAX_FAILED_ATTEMPTS)
                .copied(),
            Some(5)
        );
        assert_eq!(
            matches
                .get_one::<u64>(security::ARG_SESSION_TIMEOUT_SECONDS)
                .copied(),
            Some(1800)
        );
        assert_eq!(
            matches
                .get_one::<Severity>(alerts::ARG_ALERT_THRESHOLD)
                .copied(),
            Some(Severity::High)
        );
        assert!(!matches.get_flag(ARG_ALLOW_ANY_CERTIFICATE));
    }

    #[test]
    fn test_check_env() {
        temp_env::with_vars(
            [
                ("GARDISTO_STORE_URL", Some("https://store.example.com")),
                ("GARDISTO_STORE_TOKEN", Some("store-token")),
                (
                    "GARDISTO_KEYSTORE_URL",
                    Some("https://vault.example.com:8200"),
                ),
                ("GARDISTO_KEYSTORE_TOKEN", Some("keystore-token")),
                (
                    "GARDISTO_PIN_SHA256",
                    Some("aa:bb,1122334455667788112233445566778811223344556677881122334455667788"),
                ),
                ("GARDISTO_MAX_FAILED_ATTEMPTS", Some("3")),
                ("GARDISTO_ALERT_THRESHOLD", Some("critical")),
                ("GARDISTO_LOG_LEVEL", Some("info")),
            ],
            || {
                let command = new();
                let matches = command.get_matches_from(vec!["gardisto"]);

                assert_eq!(
                    matches.get_one::<String>(store::ARG_STORE_URL).cloned(),
                    Some("https://store.example.com".to_string())
                );
                // Comma-delimited env value yields one pin per entry
                assert_eq!(
                    matches
                        .get_many::<String>(ARG_PIN_SHA256)
                        .map(Iterator::count),
                    Some(2)
                );
                assert_eq!(
                    matches
                        .get_one::<u32>(security::ARG_MAX_FAILED_ATTEMPTS)
                        .copied(),
                    Some(3)
                );
                assert_eq!(
                    matches
                        .get_one::<Severity>(alerts::ARG_ALERT_THRESHOLD)
                        .copied(),
                    Some(Severity::Critical)
                );
                assert_eq!(
                    matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                    Some(2)
                );
            },
        );
    }

    #[test]
    fn test_check_log_level_env() {
        // loop cover all possible value_parse
        let levels = ["error", "warn", "info", "debug", "trace"];
        for (index, &level) in levels.iter().enumerate() {
            temp_env::with_vars(
                [
                    ("GARDISTO_LOG_LEVEL", Some(level)),
                    ("GARDISTO_STORE_URL", Some("https://store.example.com")),
                    ("GARDISTO_STORE_TOKEN", Some("store-token")),
                    (
                        "GARDISTO_KEYSTORE_URL",
                        Some("https://vault.example.com:8200"),
                    ),
                    ("GARDISTO_KEYSTORE_TOKEN", Some("keystore-token")),
                ],
                || {
                    let command = new();
                    let matches = command.get_matches_from(vec!["gardisto"]);
                    assert_eq!(
                        matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                        u8::try_from(index).ok()
                    );
                },
            );
        }
    }

    #[test]
    fn test_check_log_level_verbosity() {
        // loop cover all possible value_parse
        let levels = ["error", "warn", "info", "debug", "trace"];
        for (index, _) in levels.iter().enumerate() {
            temp_env::with_vars([("GARDISTO_LOG_LEVEL", None::<String>)], || {
                let mut args = vec![
                    "gardisto".to_string(),
                    "--store-url".to_string(),
                    "https://store.example.com".to_string(),
                    "--store-token".to_string(),
                    "store-token".to_string(),
                    "--keystore-url".to_string(),
                    "https://vault.example.com:8200".to_string(),
                    "--keystore-token".to_string(),
                    "keystore-token".to_string(),
                ];

                // Add the appropriate number of "-v" flags based on the index
                if index > 0 {
                    let v = format!("-{}", "v".repeat(index));
                    args.push(v);
                }

                let command = new();

                let matches = command.get_matches_from(args);

                assert_eq!(
                    matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                    u8::try_from(index).ok()
                );
            });
        }
    }

    #[test]
    fn test_validate_missing_pins() -> Result<(), Box<dyn std::error::Error>> {
        with_cleared_pinning_env(|| {
            let command = new();
            let matches = command.try_get_matches_from(vec![
                "gardisto",
                "--store-url",
                "https://store.example.com",
                "--store-token",
                "token",
                "--keystore-url",
                "https://vault.example.com:8200",
                "--keystore-token",
                "token",
            ])?;
            assert!(validate(&matches).is_err(), "Should fail without pins");
            Ok(())
        })
    }

    #[test]
    fn test_validate_with_pin() -> Result<(), Box<dyn std::error::Error>> {
        with_cleared_pinning_env(|| {
            let pin = sample_pin();
            let command = new();
            let matches = command.try_get_matches_from(vec![
                "gardisto",
                "--store-url",
                "https://store.example.com",
                "--store-token",
                "token",
                "--keystore-url",
                "https://vault.example.com:8200",
                "--keystore-token",
                "token",
                "--pin-sha256",
                &pin,
            ])?;
            assert!(validate(&matches).is_ok(), "Should pass with a hex pin");
            Ok(())
        })
    }

    #[test]
    fn test_validate_allow_any() -> Result<(), Box<dyn std::error::Error>> {
        with_cleared_pinning_env(|| {
            let command = new();
            let matches = command.try_get_matches_from(vec![
                "gardisto",
                "--store-url",
                "https://store.example.com",
                "--store-token",
                "token",
                "--keystore-url",
                "https://vault.example.com:8200",
                "--keystore-token",
                "token",
                "--dangerously-allow-any-certificate",
            ])?;
            assert!(
                validate(&matches).is_ok(),
                "Should pass with the development escape hatch"
            );
            Ok(())
        })
    }

    #[test]
    fn test_validate_rejects_malformed_pin() -> Result<(), Box<dyn std::error::Error>> {
        with_cleared_pinning_env(|| {
            let command = new();
            let matches = command.try_get_matches_from(vec![
                "gardisto",
                "--store-url",
                "https://store.example.com",
                "--store-token",
                "token",
                "--keystore-url",
                "https://vault.example.com:8200",
                "--keystore-token",
                "token",
                "--pin-sha256",
                "not-a-fingerprint",
            ])?;
            assert!(
                validate(&matches).is_err(),
                "Should fail on a non-hex fingerprint"
            );
            Ok(())
        })
    }

    #[test]
    fn test_pin_conflicts_with_allow_any() {
        with_cleared_pinning_env(|| {
            let pin = sample_pin();
            let command = new();
            let result = command.try_get_matches_from(vec![
                "gardisto",
                "--store-url",
                "https://store.example.com",
                "--store-token",
                "token",
                "--keystore-url",
                "https://vault.example.com:8200",
                "--keystore-token",
                "token",
                "--pin-sha256",
                &pin,
                "--dangerously-allow-any-certificate",
            ]);
            assert_eq!(
                result.map(|_| ()).map_err(|e| e.kind()),
                Err(clap::error::ErrorKind::ArgumentConflict)
            );
        });
    }

    #[test]
    fn test_invalid_alert_threshold() {
        let command = new();
        let result = command.try_get_matches_from(vec![
            "gardisto",
            "--store-url",
            "https://store.example.com",
            "--store-token",
            "token",
            "--keystore-url",
            "https://vault.example.com:8200",
            "--keystore-token",
            "token",
            "--alert-threshold",
            "panic",
        ]);
        assert_eq!(
            result.map(|_| ()).map_err(|e| e.kind()),
            Err(clap::error::ErrorKind::ValueValidation)
        );
    }
}
