use anyhow::{anyhow, bail, Context};
use clap::Parser;
use redvid::{config, extract_video_link, ExtractError, MediaLookup, OutputMode, RedditExtractor};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Find the video behind a Reddit post", long_about = None)]
struct Cli {
    /// Post link, either `/comments/` or a `/s/` share link
    url: String,

    /// Config file to use instead of ~/.config/redvid/config.yml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Re-encode the video into this MP4 file
    #[arg(long, short, conflicts_with = "stdout")]
    output: Option<PathBuf>,

    /// Re-encode into a timestamp-named MP4 in the temp directory
    #[arg(long, conflicts_with_all = ["stdout", "output"])]
    save: bool,

    /// Stream fragmented MP4 to stdout
    #[arg(long)]
    stdout: bool,
}

impl Cli {
    fn output_mode(&self) -> Option<OutputMode> {
        if self.stdout {
            Some(OutputMode::Pipe)
        } else if let Some(path) = &self.output {
            Some(OutputMode::File(path.clone()))
        } else if self.save {
            Some(OutputMode::temp_file())
        } else {
            None
        }
    }
}

#[tokio::main]
async fn main() {
    // stdout is reserved for video data in --stdout mode
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {}", describe(&err));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loaded = match &cli.config {
        Some(path) => config::load_config_from(path.clone()),
        None => config::get_config(),
    };
    let config = loaded
        .map_err(|e| anyhow!("failed to load config: {e}"))?
        .with_env_overrides();

    let extractor = RedditExtractor::new(&config).context("invalid configuration")?;
    debug!(authenticated = extractor.is_authenticated(), "extractor ready");

    let manifest = match extract_video_link(&extractor, &cli.url).await? {
        None => bail!("{} is not a Reddit post link", cli.url),
        Some(MediaLookup::Absent) => {
            eprintln!("post has no video");
            return Ok(());
        }
        Some(MediaLookup::Found(manifest)) => manifest,
    };

    let Some(mode) = cli.output_mode() else {
        println!("{manifest}");
        return Ok(());
    };

    let command = extractor.start_transcode(&manifest, mode).await?;
    if *command.mode() == OutputMode::Pipe {
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut stream = command.stream()?;
            let mut stdout = std::io::stdout().lock();
            std::io::copy(&mut stream, &mut stdout)?;
            stdout.flush()?;
            stream.finish()?;
            Ok(())
        })
        .await??;
    } else {
        let path = tokio::task::spawn_blocking(move || command.run()).await??;
        info!(path = %path.display(), "video saved");
        println!("{}", path.display());
    }
    Ok(())
}

fn describe(err: &anyhow::Error) -> String {
    match err.downcast_ref::<ExtractError>() {
        Some(e) if e.is_timeout() => "no connection to Reddit".to_string(),
        Some(e) => {
            debug!(kind = ?e.kind(), error = ?e, "resolution failed");
            format!("internal error while reading the post: {e}")
        }
        None => format!("{err:#}"),
    }
}
