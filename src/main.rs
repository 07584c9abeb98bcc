use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;

use jwt_proxy::modules::{self, LogLevel};
use jwt_proxy::proxy::{self, security::DEFAULT_SECRET_ENV, SecretSource};

#[derive(Parser, Debug)]
#[command(name = "jwt-proxy", version, about = "Authenticating reverse proxy with per-route JWT claim policies")]
struct Cli {
    /// Configuration file, repeatable; files are merged in order
    #[arg(short, long = "config", required = true)]
    config: Vec<PathBuf>,

    /// Log Level (DEBUG; INFO; WARN; ERROR)
    #[arg(long = "log", value_enum, ignore_case = true, default_value_t = LogLevel::Info)]
    log: LogLevel,

    /// Also write daily rolling log files to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Environment variable holding the HMAC secret
    #[arg(long, default_value = DEFAULT_SECRET_ENV)]
    secret_env: String,
}

/// Rewrites the single-dash long flags (`-config`, `-log`) to their `--` form.
fn normalize_args<I: IntoIterator<Item = OsString>>(args: I) -> Vec<OsString> {
    args.into_iter()
        .map(|arg| {
            let Some(s) = arg.to_str().map(str::to_owned) else {
                return arg;
            };
            for flag in ["-config", "-log"] {
                if s == flag || s.strip_prefix(flag).is_some_and(|rest| rest.starts_with('=')) {
                    return OsString::from(format!("-{}", s));
                }
            }
            arg
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));
    modules::init_logger(cli.log, cli.log_dir.as_deref());

    let proxies = modules::load_config_files(&cli.config).map_err(|e| {
        tracing::error!("{}", e);
        e.to_string()
    })?;

    let secret = SecretSource::Env(cli.secret_env.clone());
    if secret.current().is_none() {
        tracing::warn!(
            "{} is not set; every bearer token will be rejected until it is",
            cli.secret_env
        );
    }

    tracing::info!("starting {} proxies", proxies.len());

    tokio::select! {
        result = proxy::run(proxies, secret) => result.map_err(|e| {
            tracing::error!("{}", e);
            e
        }),
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| format!("failed to listen for shutdown signal: {}", e))?;
            tracing::info!("shutdown requested, stopping proxies...");
            Ok(())
        }
    }
}
