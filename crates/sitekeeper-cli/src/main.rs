//! Sitekeeper CLI — operator client for the controller's admin REST surface.
//!
//! A standalone HTTP client, no internal crate dependencies beyond what it
//! needs to compute upload hashes — talks exclusively over the REST API the
//! controller exposes under its admin router.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use sha2::{Digest, Sha256};

// ── ANSI color helpers ───────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

const BANNER: &str = r"
  ███████╗██╗████████╗███████╗██╗  ██╗███████╗███████╗██████╗ ███████╗██████╗
  ██╔════╝██║╚══██╔══╝██╔════╝██║ ██╔╝██╔════╝██╔════╝██╔══██╗██╔════╝██╔══██╗
  ███████╗██║   ██║   █████╗  █████╔╝ █████╗  █████╗  ██████╔╝█████╗  ██████╔╝
  ╚════██║██║   ██║   ██╔══╝  ██╔═██╗ ██╔══╝  ██╔══╝  ██╔═══╝ ██╔══╝  ██╔══██╗
  ███████║██║   ██║   ███████╗██║  ██╗███████╗███████╗██║     ███████╗██║  ██║
  ╚══════╝╚═╝   ╚═╝   ╚══════╝╚═╝  ╚═╝╚══════╝╚══════╝╚═╝     ╚══════╝╚═╝  ╚═╝
";

fn print_banner() {
    println!("{CYAN}{BOLD}{BANNER}{RESET}");
    println!("  {DIM}Fleet control for static-site edge nodes.{RESET}");
    println!();
}

// ── CLI structure ────────────────────────────────────────────────────

/// Sitekeeper — operator CLI for the controller's admin surface.
#[derive(Parser)]
#[command(
    name = "sitekeeper",
    version,
    about = "Sitekeeper CLI — manage sites, app bundles, certificates, and fleet health",
    long_about = None,
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         SITEKEEPER_ADDR   Controller admin address (default: http://127.0.0.1:8080)\n  \
         SITEKEEPER_TOKEN  Bearer authentication token\n\n\
         {DIM}Examples:{RESET}\n  \
         sitekeeper site list\n  \
         sitekeeper site create example.com --alias www.example.com\n  \
         sitekeeper app upload myapp ./dist.tar.gz\n  \
         sitekeeper certificate create-acme example.com"
    ),
)]
struct Cli {
    /// Controller admin address.
    #[arg(long, env = "SITEKEEPER_ADDR", default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Bearer authentication token.
    #[arg(long, env = "SITEKEEPER_TOKEN")]
    token: Option<String>,

    /// Disable colored output.
    #[arg(long, default_value = "false")]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Site operations.
    Site {
        #[command(subcommand)]
        action: SiteCommands,
    },
    /// App bundle operations.
    App {
        #[command(subcommand)]
        action: AppCommands,
    },
    /// TLS certificate operations.
    Certificate {
        #[command(subcommand)]
        action: CertificateCommands,
    },
    /// Diffie-Hellman parameters.
    Dhparams {
        #[command(subcommand)]
        action: DhparamsCommands,
    },
    /// Whole desired-state document (get/put), for backup and scripted edits.
    State {
        #[command(subcommand)]
        action: StateCommands,
    },
    /// Ping every registered node and report fleet health.
    ClusterStatus,
    /// Show the controller's node name, leadership, and manifest file.
    Info,
}

#[derive(Subcommand)]
enum SiteCommands {
    /// List all sites.
    List,
    /// Show a single site.
    Get { domain: String },
    /// Register a new site.
    Create {
        domain: String,
        /// Additional hostnames this site also answers to (repeatable).
        #[arg(long = "alias")]
        aliases: Vec<String>,
        /// Allow long-lived client-side caching of responses.
        #[arg(long, default_value = "false")]
        client_caching: bool,
        /// Mark the site temporary (excluded from steady-state health checks).
        #[arg(long, default_value = "false")]
        temporary: bool,
    },
    /// Remove a site.
    Delete { domain: String },
    /// Update a site's aliases, caching, or temporary flag.
    Patch {
        domain: String,
        #[arg(long = "alias")]
        aliases: Option<Vec<String>>,
        #[arg(long)]
        client_caching: Option<bool>,
        #[arg(long)]
        temporary: Option<bool>,
    },
    /// Bind an uploaded app bundle to a site.
    BindApp { domain: String, app: String },
}

#[derive(Subcommand)]
enum AppCommands {
    /// List uploaded app bundle names.
    List,
    /// Upload a bundle file, computing its SHA-256 hash for integrity checks.
    Upload {
        name: String,
        /// Path to the bundle archive on disk.
        file: String,
        /// Base64-encoded signature over the bundle hash, if code-signing is enforced.
        #[arg(long)]
        signature: Option<String>,
    },
    /// Delete an uploaded bundle.
    Delete { name: String },
}

#[derive(Subcommand)]
enum CertificateCommands {
    /// List certificates known to the controller.
    List,
    /// Import an externally-issued key/certificate pair.
    CreateImported {
        id: String,
        /// Path to the PEM-encoded private key.
        key_file: String,
        /// Path to the PEM-encoded certificate.
        certificate_file: String,
    },
    /// Generate a self-signed certificate for the given domains.
    CreateSelfSigned {
        id: String,
        /// Domains to cover (repeatable).
        #[arg(required = true)]
        domains: Vec<String>,
    },
    /// Request an ACME-issued certificate for the given domains.
    CreateAcme {
        /// Domains to cover (repeatable).
        #[arg(required = true)]
        domains: Vec<String>,
    },
    /// Delete a certificate.
    Delete { id: String },
    /// Enqueue renewal jobs for self-signed certificates nearing expiry.
    Refresh,
}

#[derive(Subcommand)]
enum DhparamsCommands {
    /// Show the current Diffie-Hellman parameters metadata.
    Get,
    /// Enqueue a background regeneration job.
    Regenerate,
}

#[derive(Subcommand)]
enum StateCommands {
    /// Print the full desired-state document as JSON.
    Get,
    /// Replace the full desired-state document from a JSON file.
    Put { file: String },
}

// ── HTTP client ──────────────────────────────────────────────────────

struct Client {
    http: reqwest::Client,
    addr: String,
    token: Option<String>,
}

impl Client {
    fn new(addr: String, token: Option<String>) -> Self {
        Self { http: reqwest::Client::new(), addr, token }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.addr)
    }

    fn auth_header(&self) -> Result<String> {
        self.token
            .clone()
            .map(|t| format!("Bearer {t}"))
            .ok_or_else(|| anyhow::anyhow!("no token provided — set SITEKEEPER_TOKEN or use --token"))
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let auth = self.auth_header()?;
        let resp = self.http.get(self.url(path)).header("Authorization", auth).send().await.context("request failed")?;
        handle_response(resp).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let auth = self.auth_header()?;
        let resp = self
            .http
            .post(self.url(path))
            .header("Authorization", auth)
            .json(body)
            .send()
            .await
            .context("request failed")?;
        handle_response(resp).await
    }

    async fn post_no_body(&self, path: &str) -> Result<Value> {
        let auth = self.auth_header()?;
        let resp = self.http.post(self.url(path)).header("Authorization", auth).send().await.context("request failed")?;
        handle_response(resp).await
    }

    async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        let auth = self.auth_header()?;
        let resp = self
            .http
            .put(self.url(path))
            .header("Authorization", auth)
            .json(body)
            .send()
            .await
            .context("request failed")?;
        handle_response(resp).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        let auth = self.auth_header()?;
        let resp = self.http.delete(self.url(path)).header("Authorization", auth).send().await.context("request failed")?;
        handle_response(resp).await
    }

    async fn patch(&self, path: &str, body: &Value) -> Result<Value> {
        let auth = self.auth_header()?;
        let resp = self
            .http
            .patch(self.url(path))
            .header("Authorization", auth)
            .json(body)
            .send()
            .await
            .context("request failed")?;
        handle_response(resp).await
    }

    async fn upload(&self, path: &str, query: &[(&str, &str)], body: Vec<u8>) -> Result<Value> {
        let auth = self.auth_header()?;
        let resp = self
            .http
            .post(self.url(path))
            .header("Authorization", auth)
            .query(query)
            .body(body)
            .send()
            .await
            .context("request failed")?;
        handle_response(resp).await
    }
}

async fn handle_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    let body = resp.text().await.context("failed to read response body")?;
    if !status.is_success() {
        bail!("server returned {status}: {body}");
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).context("failed to parse response JSON")
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if !cli.no_color {
        print_banner();
    }
    let client = Client::new(cli.addr, cli.token);

    match run(&client, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("  {RED}{BOLD}✗ Error:{RESET} {e:#}");
            eprintln!();
            ExitCode::FAILURE
        }
    }
}

async fn run(client: &Client, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Site { action } => cmd_site(client, action).await,
        Commands::App { action } => cmd_app(client, action).await,
        Commands::Certificate { action } => cmd_certificate(client, action).await,
        Commands::Dhparams { action } => cmd_dhparams(client, action).await,
        Commands::State { action } => cmd_state(client, action).await,
        Commands::ClusterStatus => cmd_cluster_status(client).await,
        Commands::Info => cmd_info(client).await,
    }
}

fn success(msg: &str) {
    println!("{GREEN}{BOLD}✓{RESET} {msg}");
}

fn warning(msg: &str) {
    println!("{YELLOW}{BOLD}⚠{RESET} {YELLOW}{msg}{RESET}");
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(_) => println!("{value}"),
    }
}

// ── Site commands ────────────────────────────────────────────────────

async fn cmd_site(client: &Client, action: SiteCommands) -> Result<()> {
    match action {
        SiteCommands::List => {
            let resp = client.get("/site").await?;
            print_json(&resp);
        }
        SiteCommands::Get { domain } => {
            let resp = client.get(&format!("/site/{domain}")).await?;
            print_json(&resp);
        }
        SiteCommands::Create { domain, aliases, client_caching, temporary } => {
            let body = serde_json::json!({
                "domain": domain,
                "aliases": aliases,
                "client_caching": client_caching,
                "temporary": temporary,
            });
            let resp = client.post("/site", &body).await?;
            success(&format!("site {BOLD}{domain}{RESET} created"));
            print_json(&resp);
        }
        SiteCommands::Delete { domain } => {
            client.delete(&format!("/site/{domain}")).await?;
            success(&format!("site {BOLD}{domain}{RESET} deleted"));
        }
        SiteCommands::Patch { domain, aliases, client_caching, temporary } => {
            let mut body = serde_json::Map::new();
            if let Some(a) = aliases {
                body.insert("aliases".to_owned(), serde_json::json!(a));
            }
            if let Some(c) = client_caching {
                body.insert("client_caching".to_owned(), serde_json::json!(c));
            }
            if let Some(t) = temporary {
                body.insert("temporary".to_owned(), serde_json::json!(t));
            }
            let resp = client.patch(&format!("/site/{domain}"), &Value::Object(body)).await?;
            success(&format!("site {BOLD}{domain}{RESET} updated"));
            print_json(&resp);
        }
        SiteCommands::BindApp { domain, app } => {
            let body = serde_json::json!({ "app": app });
            let resp = client.post(&format!("/site/{domain}/app"), &body).await?;
            success(&format!("site {BOLD}{domain}{RESET} bound to app {BOLD}{app}{RESET}"));
            print_json(&resp);
        }
    }
    Ok(())
}

// ── App commands ─────────────────────────────────────────────────────

async fn cmd_app(client: &Client, action: AppCommands) -> Result<()> {
    match action {
        AppCommands::List => {
            let resp = client.get("/app").await?;
            print_json(&resp);
        }
        AppCommands::Upload { name, file, signature } => {
            let bytes = std::fs::read(&file).with_context(|| format!("failed to read bundle file: {file}"))?;
            let hash = hex::encode(Sha256::digest(&bytes));
            let mut query = vec![("name", name.as_str()), ("hash", hash.as_str())];
            if let Some(sig) = &signature {
                query.push(("signature", sig.as_str()));
            }
            client.upload("/app", &query, bytes).await?;
            success(&format!("app {BOLD}{name}{RESET} uploaded ({DIM}sha256={hash}{RESET})"));
        }
        AppCommands::Delete { name } => {
            client.delete(&format!("/app/{name}")).await?;
            success(&format!("app {BOLD}{name}{RESET} deleted"));
        }
    }
    Ok(())
}

// ── Certificate commands ─────────────────────────────────────────────

async fn cmd_certificate(client: &Client, action: CertificateCommands) -> Result<()> {
    match action {
        CertificateCommands::List => {
            let resp = client.get("/certificate").await?;
            print_json(&resp);
        }
        CertificateCommands::CreateImported { id, key_file, certificate_file } => {
            let key_pem = std::fs::read_to_string(&key_file).with_context(|| format!("failed to read key file: {key_file}"))?;
            let certificate_pem = std::fs::read_to_string(&certificate_file)
                .with_context(|| format!("failed to read certificate file: {certificate_file}"))?;
            let body = serde_json::json!({ "type": "IMPORTED", "id": id, "key_pem": key_pem, "certificate_pem": certificate_pem });
            client.post("/certificate", &body).await?;
            success(&format!("certificate {BOLD}{id}{RESET} imported"));
        }
        CertificateCommands::CreateSelfSigned { id, domains } => {
            let body = serde_json::json!({ "type": "SELF_SIGNED", "id": id, "domains": domains });
            client.post("/certificate", &body).await?;
            success(&format!("self-signed certificate {BOLD}{id}{RESET} created"));
        }
        CertificateCommands::CreateAcme { domains } => {
            let body = serde_json::json!({ "type": "ACME", "domains": domains });
            client.post("/certificate", &body).await?;
            success("ACME certificate issuance requested");
        }
        CertificateCommands::Delete { id } => {
            client.delete(&format!("/certificate/{id}")).await?;
            success(&format!("certificate {BOLD}{id}{RESET} deleted"));
        }
        CertificateCommands::Refresh => {
            let resp = client.post_no_body("/certificate/refresh").await?;
            print_json(&resp);
        }
    }
    Ok(())
}

// ── Dhparams commands ────────────────────────────────────────────────

async fn cmd_dhparams(client: &Client, action: DhparamsCommands) -> Result<()> {
    match action {
        DhparamsCommands::Get => {
            let resp = client.get("/dhparams").await?;
            print_json(&resp);
        }
        DhparamsCommands::Regenerate => {
            client.post_no_body("/dhparams").await?;
            warning("dhparams regeneration enqueued — this can take a while on a busy node");
        }
    }
    Ok(())
}

// ── State commands ───────────────────────────────────────────────────

async fn cmd_state(client: &Client, action: StateCommands) -> Result<()> {
    match action {
        StateCommands::Get => {
            let resp = client.get("/state").await?;
            print_json(&resp);
        }
        StateCommands::Put { file } => {
            let content = std::fs::read_to_string(&file).with_context(|| format!("failed to read state file: {file}"))?;
            let body: Value = serde_json::from_str(&content).context("state file is not valid JSON")?;
            warning("replacing the full desired-state document — this affects every site in the fleet");
            let resp = client.put("/state", &body).await?;
            success("desired state replaced");
            print_json(&resp);
        }
    }
    Ok(())
}

// ── Cluster / info commands ──────────────────────────────────────────

async fn cmd_cluster_status(client: &Client) -> Result<()> {
    let resp = client.get("/clusterstatus").await?;
    print_json(&resp);
    Ok(())
}

async fn cmd_info(client: &Client) -> Result<()> {
    let resp = client.get("/info").await?;
    print_json(&resp);
    Ok(())
}
