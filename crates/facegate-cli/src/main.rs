use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, Url};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate access-matching CLI")]
struct Cli {
    /// Base URL of the facegated HTTP service
    #[arg(long, env = "FACEGATE_URL", default_value = "http://127.0.0.1:5000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled identities
    Known,
    /// Download the reference image of an identity
    Get {
        name: String,
        /// Output file (defaults to <name> plus the served extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Enroll a reference image under a name
    Register { name: String, image: PathBuf },
    /// Ask the service whether the face in an image is authorized
    Recognize {
        image: PathBuf,
        /// Tag recorded with the attempt (e.g. "front_door")
        #[arg(long)]
        action: Option<String>,
    },
    /// Show service health
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let base = cli.server.as_str();
    let client = Client::builder()
        .user_agent(format!("facegate/{}", env!("CARGO_PKG_VERSION")))
        .build()?;

    match cli.command {
        Commands::Known => {
            let resp = client.get(endpoint(base, &["known"])?).send().await?;
            print_json(resp).await?;
        }
        Commands::Status => {
            let resp = client.get(endpoint(base, &["health"])?).send().await?;
            print_json(resp).await?;
        }
        Commands::Get { name, output } => {
            let resp = client.get(endpoint(base, &["known", name.as_str()])?).send().await?;
            if !resp.status().is_success() {
                return print_json(resp).await;
            }
            let extension = match resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
            {
                Some("image/png") => "png",
                _ => "jpg",
            };
            let output = output.unwrap_or_else(|| PathBuf::from(format!("{name}.{extension}")));
            let bytes = resp.bytes().await?;
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Saved {} ({} bytes)", output.display(), bytes.len());
        }
        Commands::Register { name, image } => {
            let form = Form::new()
                .text("name", name)
                .part("image", image_part(&image).await?);
            let resp = client
                .post(endpoint(base, &["register"])?)
                .multipart(form)
                .send()
                .await?;
            print_json(resp).await?;
        }
        Commands::Recognize { image, action } => {
            let mut form = Form::new().part("image", image_part(&image).await?);
            if let Some(action) = action {
                form = form.text("action", action);
            }
            let resp = client
                .post(endpoint(base, &["recognize"])?)
                .multipart(form)
                .send()
                .await?;
            print_json(resp).await?;
        }
    }

    Ok(())
}

/// `base` with `segments` appended, each percent-encoded as one path segment.
fn endpoint(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid server URL {base:?}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("server URL {base:?} cannot take a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn image_part(path: &Path) -> Result<Part> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    Ok(Part::bytes(bytes).file_name(file_name))
}

/// Pretty-print a JSON response; non-2xx statuses become an error.
async fn print_json(resp: Response) -> Result<()> {
    let status = resp.status();
    let text = resp.text().await?;
    let body: serde_json::Value =
        serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        let code = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("request_failed");
        bail!("server returned {status}: {code}");
    }
    tracing::debug!(%status, "request completed");
    Ok(())
}
