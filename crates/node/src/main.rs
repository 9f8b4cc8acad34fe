use hashxd_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

pub mod block_processor;
pub mod config;
pub mod daemon;
pub mod mempool;
pub mod notify;
pub mod query;
pub mod reorg;
#[cfg(test)]
mod test_support;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fs2::FileExt;
use hashxd_chainstate::{ChainState, ChainStateConfig, FlushPolicy};
use hashxd_primitives::hash256_to_hex;
use hashxd_storage::fjall::{FjallOptions, FjallStore};
use hashxd_storage::memory::MemoryStore;
use hashxd_storage::{
    Column, KeyValueStore, PrefixVisitor, ScanResult, Snapshot, StoreError, WriteBatch,
};
use tokio::sync::watch;

use crate::block_processor::{BlockProcessor, ProcessorConfig};
use crate::config::{Backend, CliAction, Config};
use crate::daemon::{Backoff, RpcDaemon};
use crate::mempool::MempoolTracker;
use crate::notify::Notifier;
use crate::query::QueryService;

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const DB_DIR_NAME: &str = "db";
const STATUS_INTERVAL_SECS: u64 = 60;

pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn for_each_range<'a>(
        &self,
        column: Column,
        start: &[u8],
        end: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_range(column, start, end, visitor),
            Store::Fjall(store) => store.for_each_range(column, start, end, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }

    fn persist(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.persist(),
            Store::Fjall(store) => store.persist(),
        }
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        match self {
            Store::Memory(store) => store.snapshot(),
            Store::Fjall(store) => store.snapshot(),
        }
    }
}

fn open_store(config: &Config) -> Result<Store, String> {
    match config.backend {
        Backend::Memory => {
            log_warn!("using the in-memory backend; the index is lost on exit");
            Ok(Store::Memory(MemoryStore::new()))
        }
        Backend::Fjall => {
            let path = config.data_dir.join(DB_DIR_NAME);
            let options = FjallOptions {
                cache_bytes: Some((config.cache_mb as u64).saturating_mul(1024 * 1024) / 4),
                ..FjallOptions::default()
            };
            let store = FjallStore::open_with_options(&path, options)
                .map_err(|err| format!("failed to open database {}: {err}", path.display()))?;
            Ok(Store::Fjall(store))
        }
    }
}

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
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            if holder.is_empty() {
                Err(format!(
                    "data dir {} is already locked (another hashxd instance may be running); lock file {}",
                    data_dir.display(),
                    lock_path.display()
                ))
            } else {
                Err(format!(
                    "data dir {} is already locked (another hashxd instance may be running); lock file {} ({holder})",
                    data_dir.display(),
                    lock_path.display()
                ))
            }
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

pub async fn run_entry() -> Result<(), String> {
    match config::parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", config::usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("hashxd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(*config).await,
    }
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    log_warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        log_info!("Signal received; requesting shutdown.");
        let _ = shutdown_tx.send(true);
    });
}

fn spawn_status_logger(
    query: QueryService<RpcDaemon, Store>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            match query.view().flush_state() {
                Ok(state) => {
                    let mempool = query.mempool();
                    log_info!(
                        "status: height {} tip {} txs {} mempool {} (as of height {})",
                        state.height,
                        hash256_to_hex(&state.tip),
                        state.tx_count,
                        mempool.len(),
                        mempool.height()
                    );
                }
                Err(err) => log_warn!("status: failed to read flush state: {err}"),
            }
        }
    });
}

async fn run_with_config(config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });

    fs::create_dir_all(&config.data_dir).map_err(|err| {
        format!(
            "failed to create data dir {}: {err}",
            config.data_dir.display()
        )
    })?;
    let _lock = lock_data_dir(&config.data_dir)?;

    let store = Arc::new(open_store(&config)?);
    let chain_config = ChainStateConfig {
        reorg_limit: config.reorg_limit,
        flush_policy: FlushPolicy::from_cache_mb(
            config.cache_mb,
            Duration::from_secs(config.flush_interval_secs),
        ),
    };
    let chain = ChainState::open(Arc::clone(&store), chain_config).map_err(|err| err.to_string())?;
    log_info!(
        "hashxd {} starting at height {} tip {} (data dir {})",
        env!("CARGO_PKG_VERSION"),
        chain.height(),
        hash256_to_hex(&chain.tip()),
        config.data_dir.display()
    );

    let notifier = Notifier::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let daemon = Arc::new(RpcDaemon::new(
        config.daemon_url.clone(),
        config.daemon_user.clone(),
        config.daemon_password.clone(),
        config.daemon_timeout_secs,
    ));
    let tracker = MempoolTracker::new(chain.view(), config.mempool_conflicts, notifier.clone())
        .map_err(|err| err.to_string())?;
    let snapshots = tracker.subscribe();
    let tracker = Arc::new(Mutex::new(tracker));
    let writer = Arc::new(Mutex::new(()));

    let query = QueryService::new(chain.view(), snapshots, Arc::clone(&daemon), notifier.clone());
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let mut processor = BlockProcessor::new(
        Arc::clone(&daemon),
        chain,
        Arc::clone(&tracker),
        notifier,
        Arc::clone(&writer),
        shutdown_rx.clone(),
        ProcessorConfig {
            poll_interval,
            backoff: Backoff::default(),
            ..ProcessorConfig::default()
        },
    );

    if let Some(count) = config.force_reorg {
        log_warn!("forcing a rewind of {count} block(s) before sync");
        processor
            .force_reorg(count)
            .map_err(|err| format!("forced reorg failed: {err}"))?;
    }

    spawn_status_logger(query, shutdown_rx.clone());
    let mempool_task = tokio::spawn(mempool::run(
        daemon,
        tracker,
        writer,
        processor.subscribe_caught_up(),
        shutdown_rx,
        poll_interval,
    ));

    let result = processor.run().await;
    mempool_task.abort();
    match result {
        Ok(()) => {
            log_info!("shutdown complete");
            Ok(())
        }
        Err(err) => Err(format!("hashxd stopped: {err}")),
    }
}
