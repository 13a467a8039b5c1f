use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::{CharsetOptions, DeviceId, MAX_REQUEST_AGE, RequestId, ResponseId, SecretId};

/// Validates the request lifetime
/// Zero would make every request stale on arrival
fn validate_max_request_age(s: &str) -> Result<u64, String> {
    let value: u64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number of seconds"))?;
    if value == 0 {
        return Err("max request age must be at least 1 second".to_string());
    }
    Ok(value)
}

#[derive(Parser)]
#[command(name = "twain")]
#[command(about = "Split secrets across your devices; any two devices recover them")]
pub struct Cli {
    /// Directory holding this device's keys and shares
    #[arg(long, env = "TWAIN_STORE", default_value = "./.twain/store", global = true)]
    pub store: PathBuf,

    /// Directory shared between devices as the relay
    #[arg(long, env = "TWAIN_RELAY", default_value = "./.twain/relay", global = true)]
    pub relay: PathBuf,

    /// Seconds a reassembly request stays answerable
    #[arg(
        long,
        env = "TWAIN_MAX_REQUEST_AGE",
        default_value_t = MAX_REQUEST_AGE,
        value_parser = validate_max_request_age,
        global = true
    )]
    pub max_request_age: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create this device's keys (if needed) and publish its identity
    Init {
        /// Name other devices will see
        #[arg(short, long, default_value = "unnamed device")]
        name: String,
    },
    /// List known devices
    Devices,
    /// Split a new secret across this device and others
    Create {
        /// Label shown on every device
        #[arg(short, long)]
        title: String,

        /// Devices to share with (defaults to every known device)
        #[arg(short = 'w', long = "with")]
        with: Vec<DeviceId>,
    },
    /// List secrets this device holds a share of
    List,
    /// Pull identities, incoming shares and reassembly records from the relay
    Sync,
    /// Ask other devices for their share of a secret
    Request {
        secret_id: SecretId,
    },
    /// Show open requests and responses ready to finish
    Pending,
    /// Send this device's share to a requesting device
    Respond {
        request_id: RequestId,
    },
    /// Recover a secret from a response
    Finish {
        response_id: ResponseId,

        #[command(flatten)]
        charset: CharsetArgs,
    },
}

/// Character classes for displaying a recovered secret
#[derive(Args, Debug, Clone, Copy, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct CharsetArgs {
    /// Leave out A-Z
    #[arg(long)]
    pub no_upper: bool,
    /// Leave out a-z
    #[arg(long)]
    pub no_lower: bool,
    /// Leave out 0-9
    #[arg(long)]
    pub no_digits: bool,
    /// Leave out punctuation
    #[arg(long)]
    pub no_special: bool,
}

impl From<CharsetArgs> for CharsetOptions {
    fn from(args: CharsetArgs) -> Self {
        Self {
            include_upper: !args.no_upper,
            include_lower: !args.no_lower,
            include_digits: !args.no_digits,
            include_special: !args.no_special,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_request_age_validation() {
        assert_eq!(validate_max_request_age("60"), Ok(60));
        assert!(validate_max_request_age("0").is_err());
        assert!(validate_max_request_age("soon").is_err());
    }

    #[test]
    fn test_finish_flags_map_to_charset() {
        let cli = Cli::try_parse_from([
            "twain",
            "finish",
            "6b1f0c38-4f3e-4f64-9d6f-3a7e0f4f5b9a",
            "--no-special",
            "--no-lower",
        ])
        .unwrap();
        let Commands::Finish { charset, .. } = cli.command else {
            panic!("expected finish");
        };
        let options = CharsetOptions::from(charset);
        assert!(options.include_upper && options.include_digits);
        assert!(!options.include_lower && !options.include_special);
    }

    #[test]
    fn test_create_accepts_repeated_devices() {
        let cli = Cli::try_parse_from([
            "twain",
            "create",
            "--title",
            "bank-pin",
            "-w",
            "6b1f0c38-4f3e-4f64-9d6f-3a7e0f4f5b9a",
            "-w",
            "7c2e1d49-5a4f-4a75-8e7a-4b8f1a5a6c0b",
        ])
        .unwrap();
        let Commands::Create { title, with } = cli.command else {
            panic!("expected create");
        };
        assert_eq!(title, "bank-pin");
        assert_eq!(with.len(), 2);
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["twain", "list"]).unwrap();
        assert_eq!(cli.max_request_age, MAX_REQUEST_AGE);
    }
}
