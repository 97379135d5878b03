//! Developer CLI for the BankID RP API.
//!
//! Runs auth and sign flows against the test or production environment with
//! the relying party's own certificate, and exposes `collect` and `cancel`
//! for poking at single orders.

use std::{path::PathBuf, sync::Arc, time::Duration};

use bankid_core::{
    BankIdClient, Config, Environment, Flow, FlowHandle, FlowHooks, FlowResult, HttpTransport,
    LaunchInfo, PollConfig, TlsConfig,
};
use clap::{Parser, Subcommand};
use eyre::{bail, WrapErr};
use secrecy::SecretString;
use tracing::{info, warn};

mod store;

use store::FileResultStore;

/// BankID relying-party client.
#[derive(Parser, Debug)]
#[command(name = "bankid", version, about = "BankID relying-party client")]
struct Cli {
    /// Environment to talk to (`test` or `production`).
    #[arg(long, env = "BANKID_ENVIRONMENT", default_value = "test")]
    environment: Environment,

    /// PEM file with the RP client certificate chain.
    #[arg(long, env = "BANKID_CERT", required_unless_present = "pfx", requires = "key")]
    cert: Option<PathBuf>,

    /// PEM file with the private key of the client certificate.
    #[arg(long, env = "BANKID_KEY", requires = "cert")]
    key: Option<PathBuf>,

    /// PKCS#12 bundle (`.p12`/`.pfx`) as issued by the bank, instead of `--cert` and `--key`.
    /// Needs `--passphrase`.
    #[arg(
        long,
        env = "BANKID_PFX",
        conflicts_with_all = ["cert", "key"],
        requires = "passphrase"
    )]
    pfx: Option<PathBuf>,

    /// PEM file with the CA the server certificate must chain to.
    #[arg(long, env = "BANKID_CA")]
    ca: PathBuf,

    /// Passphrase of the PKCS#12 bundle or of an encrypted private key.
    #[arg(long, env = "BANKID_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Overrides the base URL of the selected environment.
    #[arg(long, env = "BANKID_BASE_URL")]
    base_url: Option<String>,

    /// IP address of the end user, as seen by the relying party.
    #[arg(long, env = "BANKID_END_USER_IP", default_value = "127.0.0.1")]
    end_user_ip: String,

    /// Delay between two `collect` calls in milliseconds.
    #[arg(long, env = "BANKID_POLL_INTERVAL_MS", default_value = "2000")]
    poll_interval_ms: u64,

    /// Give up on an order after this many seconds. 0 polls until the order ends.
    #[arg(long, env = "BANKID_TIMEOUT_SECS", default_value = "300")]
    timeout_secs: u64,

    /// Directory completed orders are written to as JSON.
    #[arg(long, env = "BANKID_RESULTS_DIR")]
    results_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticate a user and wait for the result.
    Auth {
        /// Personal identity number, 12 digits.
        personal_number: String,
        /// The user opens the app on another device than this one.
        #[arg(long)]
        other_device: bool,
    },
    /// Let a user sign a text and wait for the result.
    Sign {
        /// Personal identity number, 12 digits.
        personal_number: String,
        /// Text shown to the user in the app.
        #[arg(long, default_value = "Test text for signing")]
        text: String,
        /// The user opens the app on another device than this one.
        #[arg(long)]
        other_device: bool,
    },
    /// Print the current status of an order.
    Collect {
        /// The order to look up.
        order_ref: String,
    },
    /// Cancel an order.
    Cancel {
        /// The order to cancel.
        order_ref: String,
    },
}

impl Cli {
    fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
            ..PollConfig::default()
        }
    }

    fn client(&self) -> eyre::Result<BankIdClient<HttpTransport>> {
        let passphrase = self.passphrase.clone().map(SecretString::from);
        let tls = match (&self.pfx, &self.cert, &self.key) {
            (Some(pfx), _, _) => {
                let passphrase =
                    passphrase.ok_or_else(|| eyre::eyre!("--pfx needs --passphrase"))?;
                TlsConfig::from_pkcs12(pfx, &passphrase, &self.ca)?
            }
            (None, Some(cert), Some(key)) => {
                TlsConfig::from_files(cert, key, &self.ca, passphrase)?
            }
            _ => bail!("either --pfx or both --cert and --key are required"),
        };
        let mut config = Config::from_environment(&self.environment, tls);
        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url);
        }
        let mobile_policy = config.mobile_policy.clone();
        let transport = HttpTransport::new(&config).wrap_err("failed to set up the transport")?;
        Ok(BankIdClient::new(transport, mobile_policy))
    }

    fn hooks(&self) -> FlowHooks {
        let hooks = FlowHooks::new().with_launcher(|info: &LaunchInfo| {
            println!("Order {} created, open BankID with:", info.order_ref);
            println!("  {}", info.url);
            println!("  {} (iOS)", info.ios_url);
        });
        match &self.results_dir {
            Some(dir) => hooks.with_store(Arc::new(FileResultStore::new(dir.clone()))),
            None => hooks,
        }
    }
}

/// Waits for a spawned flow and cancels it on Ctrl-C.
async fn wait(mut handle: FlowHandle) -> eyre::Result<FlowResult> {
    let result = tokio::select! {
        result = handle.join() => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling the order");
            handle.cancel();
            handle.join().await
        }
    };
    Ok(result?)
}

fn report(result: FlowResult) -> eyre::Result<()> {
    match result {
        FlowResult::Complete(data) => {
            println!("Completed for {} ({})", data.user.name, data.user.personal_number);
            println!("{}", serde_json::to_string_pretty(&data.user)?);
            Ok(())
        }
        FlowResult::Failed { hint_code } => bail!("order failed: {hint_code}"),
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let client = cli.client()?;
    info!(environment = %cli.environment, "client ready");

    match &cli.command {
        Command::Auth {
            personal_number,
            other_device,
        } => {
            let flow = Flow::new(Arc::new(client), cli.poll_config(), cli.hooks())?;
            let handle = flow.spawn_auth_flow(personal_number, &cli.end_user_ip, *other_device);
            let result = wait(handle).await?;
            flow.persisted().await;
            report(result)
        }
        Command::Sign {
            personal_number,
            text,
            other_device,
        } => {
            let flow = Flow::new(Arc::new(client), cli.poll_config(), cli.hooks())?;
            let handle =
                flow.spawn_sign_flow(personal_number, &cli.end_user_ip, text, *other_device);
            let result = wait(handle).await?;
            flow.persisted().await;
            report(result)
        }
        Command::Collect { order_ref } => {
            let response = client.collect(order_ref).await?;
            println!("status: {:?}", response.status);
            if let Some(hint_code) = response.hint_code {
                println!("hint: {hint_code}");
            }
            if let Some(data) = response.completion_data {
                println!("{}", serde_json::to_string_pretty(&data)?);
            }
            Ok(())
        }
        Command::Cancel { order_ref } => {
            client.cancel(order_ref).await?;
            println!("Order {order_ref} cancelled");
            Ok(())
        }
    }
}
