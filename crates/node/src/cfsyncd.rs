use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use cfsync::clients::Clients;
use cfsync::config::{parse_args, usage, CliAction, Config};
use cfsync_log::{log_error, log_info};
use fs2::FileExt;

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ = File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already locked (another cfsyncd instance may be running); lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

async fn run(config: Config) -> Result<(), String> {
    cfsync_log::init(config.log_config());
    fs::create_dir_all(&config.data_dir)
        .map_err(|err| format!("failed to create data dir {}: {err}", config.data_dir.display()))?;
    let _lock = lock_data_dir(&config.data_dir)?;
    log_info!(
        "cfsyncd {} starting: chain {} backend {} data dir {}",
        env!("CARGO_PKG_VERSION"),
        config.chain,
        config.backend.as_str(),
        config.data_dir.display()
    );

    let clients = Clients::new(config.backend, config.data_dir.clone());
    if !clients.start_with(config.chain, config.network_config())? {
        return Err(format!("{} client is already running", config.chain));
    }

    let mut ticker = config.status_interval().map(tokio::time::interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(err) = result {
                    log_error!("failed to listen for ctrl-c: {err}");
                }
                break;
            }
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some(status) = clients.status(config.chain).await {
                    log_info!("Status: {status}");
                }
            }
        }
    }

    log_info!("shutting down");
    clients.stop_all().await;
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let result = match parse_args() {
        Ok(CliAction::PrintHelp) => {
            println!("{}", usage());
            Ok(())
        }
        Ok(CliAction::PrintVersion) => {
            println!("cfsyncd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Ok(CliAction::Run(config)) => run(config).await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
