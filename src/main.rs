use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use nocturna_render::{ApiVersion, Error, RenderConfig, RenderRequest, Renderer};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nocturna-render", version, about = "Render astrological charts with headless Chrome")]
struct Cli {
    /// Directory holding `templates/` and `lib/`
    #[arg(long, env = "NOCTURNA_ASSETS_DIR", default_value = "assets", global = true)]
    assets_dir: PathBuf,

    /// Browser binary; auto-detected when omitted
    #[arg(long, env = "CHROME_EXECUTABLE_PATH", global = true)]
    chrome_path: Option<PathBuf>,

    /// Ceiling on simultaneously open pages
    #[arg(long, env = "MAX_CONCURRENT_RENDERS", global = true)]
    max_concurrent: Option<usize>,

    /// Render timeout in milliseconds
    #[arg(long, env = "RENDER_TIMEOUT", global = true)]
    render_timeout: Option<u64>,

    /// Re-read templates and the library bundle on every render
    #[arg(long, global = true)]
    dev: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render one or more request files concurrently
    Render {
        /// JSON files, each holding one chart request with `renderOptions`
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Where images are written; defaults to next to each input
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = Version::V1)]
        api_version: Version,

        /// Attempts per request when the page ceiling is reached
        #[arg(long, default_value_t = 5)]
        retries: u32,
    },
    /// Start the browser and print a health report as JSON
    Health,
}

#[derive(Clone, Copy, ValueEnum)]
enum Version {
    V1,
    V2,
}

impl From<Version> for ApiVersion {
    fn from(v: Version) -> Self {
        match v {
            Version::V1 => ApiVersion::V1,
            Version::V2 => ApiVersion::V2,
        }
    }
}

impl Cli {
    fn config(&self) -> RenderConfig {
        let mut config = RenderConfig::from_env();
        config.assets_dir = self.assets_dir.clone();
        if let Some(path) = &self.chrome_path {
            config.chrome_path = Some(path.clone());
        }
        if let Some(n) = self.max_concurrent {
            config.max_concurrent_renders = n;
        }
        if let Some(ms) = self.render_timeout {
            config.render_timeout_ms = ms;
        }
        config.dev_mode |= self.dev;
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    let grace = config.shutdown_grace();
    let renderer = Renderer::with_cdp(config);

    let ok = match cli.command {
        Command::Render { inputs, out_dir, api_version, retries } => {
            let work = render_all(&renderer, &inputs, out_dir.as_deref(), api_version.into(), retries);
            tokio::select! {
                ok = work => ok,
                _ = tokio::signal::ctrl_c() => {
                    log::warn!("Interrupted; shutting down");
                    false
                }
            }
        }
        Command::Health => health(&renderer),
    };

    renderer.shutdown(grace).await;
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn health(renderer: &Renderer) -> bool {
    if let Err(e) = tokio::task::block_in_place(|| renderer.pool().initialize()) {
        log::error!("{}", e);
    }
    let report = renderer.health();
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to serialize health report: {}", e),
    }
    report.browser_ready
}

async fn render_all(
    renderer: &Renderer,
    inputs: &[PathBuf],
    out_dir: Option<&Path>,
    version: ApiVersion,
    retries: u32,
) -> bool {
    let jobs = inputs.iter().map(|input| async move {
        match render_file(renderer, input, out_dir, version, retries).await {
            Ok(output) => {
                println!("{} -> {}", input.display(), output.display());
                true
            }
            Err(e) => {
                eprintln!("{}: {:#}", input.display(), e);
                false
            }
        }
    });
    join_all(jobs).await.into_iter().all(|ok| ok)
}

async fn render_file(
    renderer: &Renderer,
    input: &Path,
    out_dir: Option<&Path>,
    version: ApiVersion,
    retries: u32,
) -> anyhow::Result<PathBuf> {
    let body = tokio::fs::read_to_string(input).await?;
    let request: RenderRequest = serde_json::from_str(&body)?;

    let mut delay = Duration::from_millis(200);
    let mut attempt = 1;
    let result = loop {
        let outcome = renderer
            .render_chart(request.chart.clone(), request.render_options.clone(), Some(version))
            .await;
        match outcome {
            Err(Error::CapacityExceeded { .. }) if attempt < retries => {
                log::debug!("{} waiting {}ms for a free page", input.display(), delay.as_millis());
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(2));
                attempt += 1;
            }
            other => break other?,
        }
    };

    let output = output_path(input, out_dir, result.format.extension());
    tokio::fs::write(&output, &result.image).await?;
    Ok(output)
}

fn output_path(input: &Path, out_dir: Option<&Path>, extension: &str) -> PathBuf {
    let stem = input.file_stem().map(|s| s.to_os_string()).unwrap_or_else(|| "chart".into());
    let dir = out_dir.map(Path::to_path_buf).unwrap_or_else(|| {
        input.parent().map(Path::to_path_buf).unwrap_or_default()
    });
    dir.join(stem).with_extension(extension)
}
