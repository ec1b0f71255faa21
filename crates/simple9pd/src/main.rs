use {
    clap::Parser,
    log::{info, warn},
    simple9p::{
        io_err, res,
        srv::{Config, Server, Shutdown},
    },
    std::path::PathBuf,
    tokio::{
        fs,
        signal::unix::{SignalKind, signal},
    },
};

#[derive(Debug, clap::Parser)]
struct Cli {
    /// Log every request and response
    #[arg(short, long)]
    debug: bool,

    /// proto!address!port (proto = tcp | unix), or the path of a device to serve.
    /// Standard input and output when omitted
    #[arg(short = 'p', long)]
    address: Option<String>,

    /// Largest message size offered to clients
    #[arg(long, default_value_t = simple9p::MAXMSG)]
    msize: u32,

    /// Directory to export
    exportdir: PathBuf,
}

/// Trigger `shutdown` on SIGINT or SIGTERM
fn watch_signals(shutdown: Shutdown) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
            }
        }
        shutdown.trigger();
    });
    Ok(())
}

async fn simple9pd_main(
    Cli {
        debug,
        address,
        msize,
        exportdir,
    }: Cli,
) -> simple9p::Result<i32> {
    if !fs::metadata(&exportdir).await?.is_dir() {
        return res!(io_err!(Other, "export directory must be a directory"));
    }

    let mut config = Config {
        msize,
        debug,
        ..Default::default()
    };

    match address {
        Some(addr) if addr.contains('!') => {
            let mut server = Server::with_config(exportdir, config);
            watch_signals(server.shutdown_handle())?;

            info!("Ready to accept clients: {}", addr);
            server.serve(&addr).await?;
        }
        Some(device) => {
            config.reconnect = true;
            let mut server = Server::with_config(exportdir, config);
            watch_signals(server.shutdown_handle())?;

            let file = fs::OpenOptions::new().read(true).write(true).open(&device).await?;
            let (reader, writer) = tokio::io::split(file);
            server.set_endpoints(reader, writer);

            info!("Serving on device {}", device);
            server.run().await?;
        }
        None => {
            let mut server = Server::with_config(exportdir, config);
            watch_signals(server.shutdown_handle())?;

            server.set_endpoints(tokio::io::stdin(), tokio::io::stdout());
            info!("Serving on standard input and output");
            server.run().await?;
        }
    }

    Ok(0)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let exit_code = simple9pd_main(cli).await.unwrap_or_else(|e| {
        warn!("Error: {:?}", e);
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_is_the_default_transport() {
        let cli = Cli::try_parse_from(["simple9pd", "/srv"]).unwrap();
        assert_eq!(cli.address, None);
        assert_eq!(cli.msize, simple9p::MAXMSG);
        assert!(!cli.debug);
        assert_eq!(cli.exportdir, PathBuf::from("/srv"));
    }

    #[test]
    fn flags_select_address_and_msize() {
        let cli = Cli::try_parse_from(["simple9pd", "-d", "-p", "tcp!0.0.0.0!564", "--msize", "4096", "/srv"]).unwrap();
        assert!(cli.debug);
        assert_eq!(cli.address.as_deref(), Some("tcp!0.0.0.0!564"));
        assert_eq!(cli.msize, 4096);
    }

    #[test]
    fn export_directory_is_required() {
        assert!(Cli::try_parse_from(["simple9pd", "-d"]).is_err());
    }

    #[tokio::test]
    async fn export_must_be_a_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().into_owned();
        let cli = Cli::try_parse_from(["simple9pd", path.as_str()]).unwrap();
        assert!(simple9pd_main(cli).await.is_err());
    }
}
