use anyhow::Result;
use clap::Parser;
use indicatif::MultiProgress;
use mailcast::cli::{self, Cli, Commands, ProgressReporter, SendRequest};
use mailcast::config::Config;
use mailcast::error::MailerError;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log buffer poisoned"))?;
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log buffer poisoned"))?;
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => process::exit(code),
        Err(e) => {
            display_error(&e);
            eprintln!("\nFor help, run: mailcast --help");
            process::exit(1);
        }
    }
}

/// Returns the process exit code
async fn run() -> Result<i32> {
    // Dependencies pull in more than one rustls crypto backend
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailcast=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailcast=info,warn"))
    };

    // Logs print above progress bars
    let multi_progress = Arc::new(MultiProgress::new());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(MultiProgressMakeWriter {
            multi: Arc::clone(&multi_progress),
        })
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let reporter = ProgressReporter::with_multi((*multi_progress).clone());

    if let Commands::InitConfig { output, force } = &cli.command {
        let output = match output {
            Some(path) => path.clone(),
            None => cli.config_path()?,
        };
        cli::run_init_config(&output, *force).await?;
        println!("Created example configuration at {}", output.display());
        return Ok(0);
    }

    let config = Config::load(&cli.config_path()?).await?;
    let paths = cli.resolve_paths(&config)?;
    tracing::debug!("Using {:?}", paths);

    match cli.command {
        Commands::Setup { provider, force } => {
            cli::run_setup(&config, &paths, provider, force, &reporter).await?;
            println!("Setup complete.");
            Ok(0)
        }

        Commands::Send {
            to,
            subject,
            body,
            attach,
            concurrency,
        } => {
            let request = SendRequest::from_args(&config, to, subject, body, attach, concurrency)?;
            let provider = cli::connect_provider(&config, &paths).await?;
            let report = cli::run_send(provider, &request, &reporter).await?;

            if report.total() > 1 {
                println!("All emails sent.");
            }
            if report.failed() > 0 {
                eprintln!("{} of {} sends failed", report.failed(), report.total());
            }
            Ok(report.exit_code())
        }

        Commands::InitConfig { .. } => Ok(0),
    }
}

/// Display error with context
fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    // Display error chain
    let mut cause = error.source();
    while let Some(e) = cause {
        eprintln!("  Caused by: {}", e);
        cause = e.source();
    }

    // Display helpful hints based on error type
    if let Some(mailer_err) = error.downcast_ref::<MailerError>() {
        match mailer_err {
            MailerError::AuthError(_) => {
                eprintln!("\nHint: Make sure your credentials.json file is valid.");
                eprintln!("      You can download it from Google Cloud Console.");
                eprintln!("      Try running: mailcast setup google --force");
            }
            MailerError::ConfigError(_) => {
                eprintln!("\nHint: Check your configuration file and credential paths.");
                eprintln!("      Run: mailcast init-config --force");
            }
            MailerError::AttachmentError { .. } => {
                eprintln!("\nHint: Check that every attachment is readable.");
            }
            MailerError::RateLimitExceeded(_) => {
                eprintln!("\nHint: You've hit Gmail API rate limits.");
                eprintln!("      Consider lowering --concurrency.");
            }
            _ => {}
        }
    }
}
