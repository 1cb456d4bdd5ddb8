use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use sri_core::access_key::{AccessKey, generate_access_key, validate_access_key};
use sri_core::api::SriClient;
use sri_core::config::{Config, EnvironmentType};
use sri_core::orchestrator::{
    Orchestrator, ProgressEvent, SubmissionOutcome, SubmissionRequest, SystemClock,
};
use sri_core::sign::{DocumentSigner, SigningCredential};

#[derive(Parser)]
#[command(name = "sri")]
#[command(about = "Sign and submit electronic documents to the Ecuadorian SRI")]
struct Cli {
    /// Target environment (test or production). Overrides the config file.
    #[arg(long, global = true)]
    env: Option<EnvironmentType>,
    /// TOML configuration file.
    #[arg(long, global = true, env = "SRI_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CredentialArgs {
    /// PKCS#12 bundle holding the signing key and certificate.
    #[arg(long)]
    p12: Option<PathBuf>,
    #[arg(long, env = "SRI_P12_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

impl CredentialArgs {
    fn load(&self) -> Result<Option<SigningCredential>> {
        let Some(path) = &self.p12 else {
            return Ok(None);
        };
        let password = self
            .password
            .clone()
            .context("--password (or SRI_P12_PASSWORD) is required with --p12")?;
        Ok(Some(SigningCredential::from_file(path, password)?))
    }

    fn require(&self) -> Result<SigningCredential> {
        self.load()?.context("--p12 is required")
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a 49-digit access key.
    AccessKey {
        /// Issue date, DD/MM/YYYY.
        #[arg(long)]
        date: String,
        /// Document type code, e.g. 01 for an invoice.
        #[arg(long, default_value = "01")]
        doc_type: String,
        #[arg(long)]
        ruc: String,
        #[arg(long, default_value = "001")]
        establishment: String,
        #[arg(long, default_value = "001")]
        emission_point: String,
        #[arg(long)]
        sequential: String,
        /// Eight-digit numeric code. Random when omitted.
        #[arg(long)]
        numeric_code: Option<String>,
    },
    /// Check the structure and check digit of an access key.
    ValidateKey { key: String },
    /// Print the certificate details of a PKCS#12 bundle.
    CertInfo {
        #[command(flatten)]
        credential: CredentialArgs,
    },
    /// Sign an unsigned document with XAdES-BES.
    Sign {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        credential: CredentialArgs,
    },
    /// Sign, submit and poll a document until the SRI gives a final answer.
    Submit {
        #[arg(long)]
        input: PathBuf,
        /// Where to write the signed document.
        #[arg(long)]
        signed_output: Option<PathBuf>,
        #[command(flatten)]
        credential: CredentialArgs,
    },
    /// Poll the authorization of an already submitted access key.
    Authorize { key: String },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };
    let config = match cli.env {
        Some(env) if env != config.env() => Config::new(env)
            .with_request_timeout(config.request_timeout())
            .with_polling(config.polling())
            .with_digest(config.digest()),
        _ => config,
    };
    Ok(config.with_env_overrides())
}

fn read_document(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn write_or_print(output: Option<&Path>, contents: &str) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{contents}");
            Ok(())
        }
    }
}

fn print_progress(event: ProgressEvent) {
    eprintln!(
        "{} {:<14} {}",
        event.at.format("%H:%M:%S%.3f"),
        event.state.to_string(),
        event.message
    );
}

fn report(outcome: &SubmissionOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    if !matches!(outcome, SubmissionOutcome::Authorized { .. }) {
        std::process::exit(2);
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::AccessKey {
            date,
            doc_type,
            ruc,
            establishment,
            emission_point,
            sequential,
            numeric_code,
        } => {
            let config = load_config(&cli)?;
            let key = generate_access_key(
                date,
                doc_type,
                ruc,
                &config.env().code().to_string(),
                establishment,
                emission_point,
                sequential,
                numeric_code.as_deref(),
                None,
            )?;
            println!("{key}");
        }
        Commands::ValidateKey { key } => {
            let validation = validate_access_key(key);
            println!("{}", serde_json::to_string_pretty(&validation)?);
            if !validation.valid {
                bail!(
                    "invalid access key: {}",
                    validation.reason.unwrap_or_default()
                );
            }
        }
        Commands::CertInfo { credential } => {
            let info = credential.require()?.certificate_info()?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Sign {
            input,
            output,
            credential,
        } => {
            let config = load_config(&cli)?;
            let xml = read_document(input)?;
            let signed = DocumentSigner::new(config.digest()).sign(&xml, credential.require()?)?;
            log::info!("signed document {}", signed.access_key());
            write_or_print(output.as_deref(), signed.xml())?;
        }
        Commands::Submit {
            input,
            signed_output,
            credential,
        } => {
            let config = load_config(&cli)?;
            let mut request = SubmissionRequest::new(read_document(input)?);
            if let Some(credential) = credential.load()? {
                request = request.with_credential(credential);
            }
            let outcome = runtime()?.block_on(async {
                let client = SriClient::new(config.clone())?;
                let orchestrator = Orchestrator::new(client, SystemClock, config);
                orchestrator.submit(request, &print_progress).await
            })?;
            if let (Some(path), Some(xml)) = (signed_output, signed_xml(&outcome)) {
                write_or_print(Some(path.as_path()), xml)?;
            }
            report(&outcome)?;
        }
        Commands::Authorize { key } => {
            let config = load_config(&cli)?;
            let key = AccessKey::parse(key)?;
            let outcome = runtime()?.block_on(async {
                let client = SriClient::new(config.clone())?;
                let orchestrator = Orchestrator::new(client, SystemClock, config);
                orchestrator.resume_polling(&key, &print_progress).await
            })?;
            report(&outcome)?;
        }
    }

    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")
}

fn signed_xml(outcome: &SubmissionOutcome) -> Option<&str> {
    match outcome {
        SubmissionOutcome::Authorized { signed_xml, .. }
        | SubmissionOutcome::Rejected { signed_xml, .. }
        | SubmissionOutcome::Pending { signed_xml, .. } => signed_xml.as_deref(),
    }
}
