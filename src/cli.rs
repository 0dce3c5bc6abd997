//! Command-line interface

use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::attachment::AttachmentSet;
use crate::auth::{resolve_client_secret, AuthOptions, TokenManager, TokenSource};
use crate::client::{GmailProvider, MailProvider};
use crate::config::{app_config_dir, ensure_app_config_dir, Config, MAX_CONCURRENT_SENDS};
use crate::dispatch::{BulkDispatcher, DispatchReport};
use crate::error::{MailerError, Result};
use crate::message::Composition;
use crate::recipients::{resolve_body, resolve_recipients};
use crate::token_store::{CredentialStore, FileCredentialStore};

#[derive(Parser, Debug)]
#[command(name = "mailcast")]
#[command(version)]
#[command(about = "Send email through Gmail from the command line", long_about = None)]
pub struct Cli {
    /// Path to configuration file [default: <config dir>/config.toml]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to OAuth2 client credentials file
    #[arg(long, global = true)]
    pub credentials: Option<PathBuf>,

    /// Path to token cache file
    #[arg(long, global = true)]
    pub token_cache: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authorize access to a mail provider and cache the token
    Setup {
        /// Mail provider to set up
        #[arg(value_enum, default_value_t = Provider::Google)]
        provider: Provider,

        /// Run the authorization flow even if a token is cached
        #[arg(long)]
        force: bool,
    },

    /// Send an email to one recipient or to every address in a list file
    #[command(after_help = "Examples:\n  \
        mailcast send --to bob@example.com --subject Hello --body \"This is a test\"\n  \
        mailcast send --to bob@example.com --subject Files --body body.txt --attach report.pdf agenda.pdf\n  \
        mailcast send --to recipients.txt --subject Files --body - < body.txt")]
    Send {
        /// Recipient address, or a text file with one address per line
        #[arg(short, long)]
        to: String,

        /// Subject line [default: send.default_subject]
        #[arg(short, long)]
        subject: Option<String>,

        /// Body text, a path to a text file, or '-' for stdin [default: send.default_body]
        #[arg(short, long)]
        body: Option<String>,

        /// Files to attach
        #[arg(short, long, num_args = 1..)]
        attach: Vec<PathBuf>,

        /// Maximum sends in flight [default: send.max_concurrent_sends]
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file [default: <config dir>/config.toml]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    #[value(alias = "gmail")]
    Google,
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi(MultiProgress::new())
    }

    /// Share `multi` with the log writer so log lines print above the bars
    pub fn with_multi(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>4}/{len:4} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    /// Reporter that draws nothing
    pub fn hidden() -> Self {
        Self::with_multi(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()))
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }

    pub fn println(&self, msg: impl AsRef<str>) {
        let _ = self.multi.println(msg);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Files used by one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub config_file: PathBuf,
    pub credentials: PathBuf,
    pub token_cache: PathBuf,
}

impl Cli {
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => Ok(app_config_dir()?.join("config.toml")),
        }
    }

    /// Command-line paths win over the config file, which wins over defaults
    pub fn resolve_paths(&self, config: &Config) -> Result<ResolvedPaths> {
        let config_dir = app_config_dir()?;
        Ok(ResolvedPaths {
            config_file: self.config_path()?,
            credentials: self
                .credentials
                .clone()
                .unwrap_or_else(|| config.auth.credentials_path(&config_dir)),
            token_cache: self
                .token_cache
                .clone()
                .unwrap_or_else(|| config.auth.token_path(&config_dir)),
        })
    }
}

/// Everything one `send` needs, resolved from flags and config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// Address or recipient list file
    pub to: String,
    pub subject: String,
    /// Literal text, body file path or `-`
    pub body: String,
    pub attachments: Vec<PathBuf>,
    pub max_in_flight: usize,
}

impl SendRequest {
    pub fn from_args(
        config: &Config,
        to: String,
        subject: Option<String>,
        body: Option<String>,
        attachments: Vec<PathBuf>,
        concurrency: Option<usize>,
    ) -> Result<Self> {
        let max_in_flight = concurrency.unwrap_or(config.send.max_concurrent_sends);
        if !(1..=MAX_CONCURRENT_SENDS).contains(&max_in_flight) {
            return Err(MailerError::ConfigError(format!(
                "--concurrency must be between 1 and {}",
                MAX_CONCURRENT_SENDS
            )));
        }

        Ok(Self {
            to,
            subject: subject.unwrap_or_else(|| config.send.default_subject.clone()),
            body: body.unwrap_or_else(|| config.send.default_body.clone()),
            attachments,
            max_in_flight,
        })
    }
}

fn token_manager(secret: &yup_oauth2::ApplicationSecret, token_cache: &Path, config: &Config) -> Arc<TokenManager> {
    let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::at_path(token_cache));
    Arc::new(TokenManager::for_secret(
        secret,
        store,
        AuthOptions::from_config(&config.auth),
        config.auth.open_browser,
    ))
}

/// Authorize (interactively when needed or forced) and report the connected account
pub async fn run_setup(
    config: &Config,
    paths: &ResolvedPaths,
    provider: Provider,
    force: bool,
    reporter: &ProgressReporter,
) -> Result<()> {
    match provider {
        Provider::Google => info!("Setting up the Google provider"),
    }

    if paths.token_cache.parent() == Some(app_config_dir()?.as_path()) {
        ensure_app_config_dir().await?;
    }

    let secret = resolve_client_secret(&paths.credentials).await?;
    let manager = token_manager(&secret, &paths.token_cache, config);

    let token = if force {
        info!("Forcing a new authorization for {}", manager.identity());
        manager.authorize().await?
    } else {
        manager.token().await?
    };
    reporter.println(format!("Token cached at {}", paths.token_cache.display()));

    let gateway = GmailProvider::connect(TokenSource::new(manager, token))?;
    let spinner = reporter.add_spinner("Looking up the connected account...");
    match gateway.profile_address().await {
        Ok(address) => reporter.finish_spinner(&spinner, &format!("Connected as {}", address)),
        Err(e) => {
            spinner.finish_and_clear();
            warn!("Authorized, but the account lookup failed: {}", e);
        }
    }
    Ok(())
}

/// Load the cached token and connect the Gmail gateway; never starts the interactive flow
pub async fn connect_provider(config: &Config, paths: &ResolvedPaths) -> Result<Arc<dyn MailProvider>> {
    let store = FileCredentialStore::at_path(&paths.token_cache);
    let token = store.load(&config.auth.identity).await?.ok_or_else(|| {
        MailerError::ConfigError(
            "No token found, please run 'mailcast setup google' first to set up the Google provider"
                .to_string(),
        )
    })?;

    let secret = resolve_client_secret(&paths.credentials).await?;
    let manager = token_manager(&secret, &paths.token_cache, config);
    Ok(Arc::new(GmailProvider::connect(TokenSource::new(manager, token))?))
}

/// The send pipeline: collect recipients and body, validate attachments,
/// encode once, then fan out.
pub async fn run_send(
    provider: Arc<dyn MailProvider>,
    request: &SendRequest,
    reporter: &ProgressReporter,
) -> Result<DispatchReport> {
    match provider.profile_address().await {
        Ok(address) => reporter.println(format!("Sending email as {}", address)),
        Err(e) => warn!("Unable to get user profile: {}", e),
    }

    let recipients = resolve_recipients(&request.to).await?;
    let body = resolve_body(&request.body).await?;

    let attachments = AttachmentSet::validate(&request.attachments);
    for path in &attachments.rejected {
        reporter.println(format!("Attachment file not found: {}", path.display()));
    }

    let mail = Composition::new(request.subject.clone(), body)
        .with_attachments(attachments.valid)
        .prepare()
        .await?;
    info!(
        "Prepared \"{}\" with {} attachment(s)",
        mail.subject(),
        mail.attachment_count()
    );

    let bar = reporter.add_progress_bar(recipients.as_slice().len() as u64, "Sending...");
    let dispatcher = BulkDispatcher::new(provider, request.max_in_flight);
    let report = dispatcher
        .dispatch(mail, &recipients, |outcome| {
            match &outcome.result {
                Ok(()) => bar.println(format!("Email sent to {} successfully.", outcome.recipient)),
                Err(e) => bar.println(format!("Failed to send email to {}: {}", outcome.recipient, e)),
            }
            bar.inc(1);
        })
        .await;

    bar.finish_with_message(format!("{} sent, {} failed", report.sent(), report.failed()));
    Ok(report)
}

/// Write a default config file, refusing to overwrite unless forced
pub async fn run_init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(MailerError::ConfigError(format!(
            "Config file already exists at {:?}. Use --force to overwrite.",
            output
        )));
    }
    Config::create_example(output).await
}
