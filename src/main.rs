use std::{process, sync::Arc, time::SystemTime};

use clap::{command, Parser, Subcommand, ValueHint};
use http::Method;
use log::{debug, error, info, LevelFilter};
use url::Url;
use veil::Redact;

use tourdesk::{
    config::Config,
    dispatcher::Dispatcher,
    error::{Error, ErrorKind, Result},
    http::{Client, Request},
    protocol::auth::Registration,
    store::{CredentialStore, FileBackend},
    token,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the tourdesk API
    #[arg(long, value_name = "URL", value_hint = ValueHint::Url, env = "TOURDESK_API_URL", default_value = "http://localhost:8080/")]
    api_url: Url,

    /// Credentials file
    ///
    /// Ensure that this file is kept secure and not shared publicly, as it
    /// contains tokens that grant access to your tourdesk account.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("credentials.toml"))]
    credentials_file: String,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Log in and store the issued tokens
    Login(LoginArgs),

    /// Create an account
    Register(RegisterArgs),

    /// Revoke the session and remove the stored tokens
    Logout,

    /// Show the logged in user
    Whoami,

    /// Send an authenticated request and print its results
    Request {
        /// HTTP method, for instance GET or POST
        method: String,

        /// Path relative to the API base URL
        path: String,

        /// JSON request body
        #[arg(short, long, value_name = "JSON")]
        body: Option<String>,
    },
}

#[derive(Clone, Redact, clap::Args)]
struct LoginArgs {
    #[arg(short, long, env = "TOURDESK_EMAIL")]
    email: String,

    #[redact]
    #[arg(short, long, env = "TOURDESK_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Clone, Redact, clap::Args)]
struct RegisterArgs {
    #[arg(long)]
    name: String,

    #[arg(long)]
    surname: String,

    #[arg(short, long)]
    email: String,

    #[arg(long)]
    phone_number: String,

    #[redact]
    #[arg(short, long, env = "TOURDESK_PASSWORD", hide_env_values = true)]
    password: String,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Prints the identity behind the stored access token.
fn whoami(store: &CredentialStore) {
    let session = store.session();
    let Some(identity) = session.identity() else {
        info!("not logged in");
        return;
    };

    println!("subject: {}", identity.subject);
    if let Some(account_id) = &identity.account_id {
        println!("account: {account_id}");
    }
    if !identity.roles.is_empty() {
        println!("roles: {}", identity.roles.join(", "));
    }

    let expires_at = store
        .access_token()
        .as_deref()
        .and_then(token::decode)
        .map(|claims| claims.time_to_live(SystemTime::now()));
    if let Some(ttl) = expires_at {
        println!("expires in: {}s", ttl.as_secs());
    }
}

/// Runs the subcommand.
///
/// # Errors
///
/// This function returns an error when the credentials file cannot be read,
/// the API cannot be reached or it rejects the request.
async fn run(args: Args) -> Result<()> {
    let backend = FileBackend::new(&args.credentials_file);
    let store = Arc::new(CredentialStore::open(backend)?);
    store.subscribe(|change| debug!("credentials {change}"));

    let config = Config::new(args.api_url)?;
    let dispatcher = Dispatcher::new(Client::new(&config)?, Arc::clone(&store));

    match args.command {
        Command::Login(LoginArgs { email, password }) => {
            dispatcher.login(&email, &password).await?;
        }
        Command::Register(RegisterArgs {
            name,
            surname,
            email,
            phone_number,
            password,
        }) => {
            let registration = Registration {
                name,
                surname,
                email,
                phone_number,
                password,
            };
            dispatcher.register(&registration).await?;
            info!("registered {}; log in to continue", registration.email);
        }
        Command::Logout => dispatcher.logout().await?,
        Command::Request { method, path, body } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())?;
            let mut request = Request::new(method, path);
            if let Some(body) = body {
                let body: serde_json::Value =
                    serde_json::from_str(&body).map_err(Error::invalid_argument)?;
                request = request.json(&body)?;
            }

            let results = dispatcher.dispatch(request).await?;
            let output = serde_json::to_string_pretty(&results)?;
            println!("{output}");
        }
        Command::Whoami => whoami(&store),
    }

    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and runs the subcommand.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();
    debug!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        if e.kind == ErrorKind::AuthExpired {
            error!("session expired, log in again");
            debug!("{e}");
        } else {
            error!("{e}");
        }
        process::exit(1);
    }
}
