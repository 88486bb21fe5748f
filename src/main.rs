use anyhow::{Context, Result};
use btstream::{Config, Opened, Session};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "btstream")]
#[command(about = "Stream files out of torrents")]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count, help = "Increase verbosity")]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the files in a torrent
    Ls {
        /// magnet: link, torrent:browse: URL or path to a .torrent file
        url: String,
    },
    /// Stream one file to stdout
    Cat {
        /// torrentfile:// or torrent:video: URL, or magnet: (largest file)
        url: String,
    },
    /// Print live transfer statistics for a torrent
    Info {
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load().context("Failed to load configuration")?;
    let session = Session::start(config)
        .await
        .context("Failed to start session")?;

    match cli.command {
        Command::Ls { url } => {
            let (torrent, path) = browse(&session, &url).await?;
            torrent.wait_metainfo().await?;
            for entry in torrent.list_dir(path.as_deref())? {
                let kind = if entry.is_dir { "dir " } else { "file" };
                println!("{kind} {:>12}  {}", entry.size, entry.path);
            }
        }
        Command::Cat { url } => {
            let (torrent, path) = match open(&session, &url).await? {
                Opened::File(torrent, path) => (torrent, path),
                Opened::Browse(torrent, _) => {
                    torrent.wait_metainfo().await?;
                    let path = torrent.largest_file_path()?;
                    (torrent, path)
                }
            };
            let mut file = torrent.open_file(&path).await?;
            // A playback-ish deadline keeps the head of the file hot
            file.set_read_deadline(Duration::from_secs(2));

            let mut stdout = std::io::stdout().lock();
            let mut buf = vec![0u8; 256 * 1024];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&buf[..n])?;
                file.set_read_deadline(Duration::from_secs(2));
            }
        }
        Command::Info { url } => {
            let (torrent, _) = browse(&session, &url).await?;
            torrent.wait_metainfo().await?;
            let stats = torrent.stats()?;
            println!("title:      {}", stats.title);
            println!("info hash:  {}", stats.info_hash);
            if let Some(total) = stats.total_length {
                println!("size:       {total}");
            }
            println!("pieces:     {} ({} on disk)", stats.num_pieces, stats.pieces_on_disk);
            println!(
                "peers:      {} known, {} connected ({} seeders / {} leechers)",
                stats.known_peers, stats.connected_peers, stats.seeders, stats.leechers
            );
            println!(
                "transfer:   {} down / {} up / {} wasted, {} B/s",
                stats.downloaded_bytes,
                stats.uploaded_bytes,
                stats.wasted_bytes,
                stats.download_rate
            );
        }
    }

    session.shutdown();
    Ok(())
}

async fn open(session: &Session, url: &str) -> Result<Opened> {
    // A bare filesystem path means a local .torrent file
    if !url.contains(':') || std::path::Path::new(url).exists() {
        let data = tokio::fs::read(url)
            .await
            .with_context(|| format!("Failed to read {url}"))?;
        let torrent = session.open_metainfo(&data).await?;
        return Ok(Opened::Browse(torrent, None));
    }
    Ok(session.open_url(url).await?)
}

async fn browse(
    session: &Session,
    url: &str,
) -> Result<(btstream::TorrentHandle, Option<String>)> {
    match open(session, url).await? {
        Opened::Browse(torrent, path) => Ok((torrent, path)),
        Opened::File(torrent, path) => Ok((torrent, Some(path))),
    }
}
