//! Demo device: shares a folder with Calibre from the command line.
//!
//! Books land in a library directory; metadata and drive info persist as
//! `.metadata.calibre` and `.driveinfo.calibre` JSON files, the format
//! Calibre's own folder devices use.

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use caldev_rs::{
    BookDetails, BookId, CalibreBookMeta, CalibreInstance, ClientOptions, CoverDims, Device,
    DeviceError, DeviceInfo, DeviceResult, MetadataIter, Session, SessionConfig, Status,
    PROTOCOL_VERSION,
};
use caldev_rs::protocol::{CalibreInitInfo, CalibreLibraryInfo};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::io::{self, SeekFrom, Write as _};
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const METADATA_FILE: &str = ".metadata.calibre";
const DRIVEINFO_FILE: &str = ".driveinfo.calibre";

/// Share a folder with Calibre as a wireless device.
#[derive(Parser, Debug)]
#[command(name = "caldev-rs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory books are stored in.
    #[arg(short, long)]
    library: Option<PathBuf>,

    /// Path to a TOML config file.
    #[arg(short, long, env = "CALDEV_CONFIG")]
    config: Option<PathBuf>,

    /// Device name shown in Calibre.
    #[arg(long)]
    name: Option<String>,

    /// Connect directly to HOST:PORT instead of probing the network.
    #[arg(long)]
    connect: Option<String>,

    /// Connection password. Prompted for when required and not given.
    #[arg(long)]
    password: Option<String>,
}

/// TOML configuration; command-line flags win over file values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct FileConfig {
    /// Device name shown in Calibre.
    device_name: Option<String>,

    /// Device model string.
    device_model: Option<String>,

    /// Directory books are stored in.
    library: Option<PathBuf>,

    /// Accepted ebook extensions.
    extensions: Option<Vec<String>>,

    /// Direct-connect host.
    host: Option<String>,

    /// Direct-connect port.
    port: Option<u16>,

    /// Connection password.
    password: Option<String>,
}

impl FileConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// A device backed by one directory of books.
struct FolderDevice {
    book_dir: PathBuf,
    options: ClientOptions,
    password: Option<String>,
    metadata: Vec<CalibreBookMeta>,
    device_info: DeviceInfo,
}

impl FolderDevice {
    fn open(
        book_dir: PathBuf,
        options: ClientOptions,
        password: Option<String>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&book_dir)
            .with_context(|| format!("failed to create {}", book_dir.display()))?;
        let mut device = Self {
            book_dir,
            options,
            password,
            metadata: Vec::new(),
            device_info: DeviceInfo::default(),
        };
        device.load_metadata()?;
        device.load_drive_info()?;
        if device.device_info.dev_info.device_name.is_empty() {
            device.device_info.dev_info.device_name = device.options.device_name.clone();
            device.device_info.dev_info.location_code = "main".into();
            device.device_info.dev_info.device_store_uuid = uuid::Uuid::new_v4().to_string();
        }
        Ok(device)
    }

    fn metadata_path(&self) -> PathBuf {
        self.book_dir.join(METADATA_FILE)
    }

    fn drive_info_path(&self) -> PathBuf {
        self.book_dir.join(DRIVEINFO_FILE)
    }

    fn load_metadata(&mut self) -> anyhow::Result<()> {
        let path = self.metadata_path();
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if !content.is_empty() {
            self.metadata = serde_json::from_slice(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
        }
        Ok(())
    }

    fn save_metadata(&self) -> DeviceResult<()> {
        let content = serde_json::to_vec_pretty(&self.metadata)?;
        std::fs::write(self.metadata_path(), content)?;
        Ok(())
    }

    fn load_drive_info(&mut self) -> anyhow::Result<()> {
        let path = self.drive_info_path();
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if !content.is_empty() {
            self.device_info.dev_info = serde_json::from_slice(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
        }
        Ok(())
    }

    fn save_drive_info(&self) -> DeviceResult<()> {
        let content = serde_json::to_vec_pretty(&self.device_info.dev_info)?;
        std::fs::write(self.drive_info_path(), content)?;
        Ok(())
    }

    fn upsert(&mut self, meta: CalibreBookMeta) {
        match self.metadata.iter_mut().find(|m| m.lpath == meta.lpath) {
            Some(slot) => *slot = meta,
            None => self.metadata.push(meta),
        }
    }

    fn sidecar_path(book_path: &Path) -> PathBuf {
        let mut name = book_path.as_os_str().to_owned();
        name.push(".jpg");
        PathBuf::from(name)
    }

    /// Resolve an lpath inside the library directory.
    ///
    /// Lpaths come straight off the wire, and `Path::join` would let an
    /// absolute second argument replace the base entirely. Absolute paths
    /// and non-plain components (`..`, `.`) are rejected so the peer
    /// stays confined to the library.
    fn book_path(&self, lpath: &str) -> DeviceResult<PathBuf> {
        let relative = Path::new(lpath);
        let confined = relative.is_relative()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !confined {
            return Err(DeviceError::new(format!(
                "refusing lpath {lpath:?} outside the library"
            )));
        }
        Ok(self.book_dir.join(relative))
    }
}

struct SnapshotIter {
    items: std::vec::IntoIter<CalibreBookMeta>,
    count: usize,
}

impl MetadataIter for SnapshotIter {
    fn count(&self) -> usize {
        self.count
    }

    fn next_meta(&mut self) -> Option<DeviceResult<CalibreBookMeta>> {
        self.items.next().map(Ok)
    }
}

#[async_trait]
impl Device for FolderDevice {
    fn client_options(&mut self) -> DeviceResult<ClientOptions> {
        Ok(self.options.clone())
    }

    fn device_book_list(&mut self) -> DeviceResult<Vec<BookDetails>> {
        Ok(self.metadata.iter().map(BookDetails::from_meta).collect())
    }

    fn metadata_iter(&mut self, books: &[BookId]) -> DeviceResult<Box<dyn MetadataIter + '_>> {
        let selected: Vec<CalibreBookMeta> = if books.is_empty() {
            self.metadata.clone()
        } else {
            books
                .iter()
                .filter_map(|id| self.metadata.iter().find(|m| m.lpath == id.lpath).cloned())
                .collect()
        };
        let count = selected.len();
        Ok(Box::new(SnapshotIter {
            items: selected.into_iter(),
            count,
        }))
    }

    fn device_info(&mut self) -> DeviceResult<DeviceInfo> {
        Ok(self.device_info.clone())
    }

    fn set_device_info(&mut self, info: DeviceInfo) -> DeviceResult<()> {
        self.device_info.dev_info = info.dev_info;
        self.save_drive_info()
    }

    fn set_library_info(&mut self, info: CalibreLibraryInfo) -> DeviceResult<()> {
        tracing::info!(library = %info.library_name, uuid = %info.library_uuid, "connected library");
        Ok(())
    }

    fn update_metadata(&mut self, metadata: Vec<CalibreBookMeta>) -> DeviceResult<()> {
        for meta in metadata {
            self.upsert(meta);
        }
        self.save_metadata()
    }

    async fn password(&mut self, _init: &CalibreInitInfo) -> DeviceResult<String> {
        match &self.password {
            Some(password) => Ok(password.clone()),
            None => prompt_password().map_err(DeviceError::new),
        }
    }

    fn free_space(&mut self) -> u64 {
        // Placeholder; measuring the filesystem is the embedder's business.
        1024 * 1024 * 1024
    }

    fn check_lpath(&mut self, lpath: &str) -> String {
        lpath.to_owned()
    }

    async fn save_book(
        &mut self,
        meta: &CalibreBookMeta,
        book: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
        last_book: bool,
    ) -> DeviceResult<()> {
        let path = self.book_path(&meta.lpath)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        let written = tokio::io::copy(book, &mut file).await?;
        file.flush().await?;
        if written != length {
            return Err(DeviceError::new(format!(
                "short book payload: {written} of {length} bytes"
            )));
        }
        let mut meta = meta.clone();
        if let Some(thumbnail) = meta.thumbnail.take() {
            let image = BASE64
                .decode(thumbnail.image_base64())
                .map_err(DeviceError::new)?;
            let sidecar = Self::sidecar_path(&path);
            tokio::fs::write(&sidecar, image).await?;
            meta.cover = Some(sidecar.to_string_lossy().into_owned());
        }
        self.upsert(meta);
        if last_book {
            self.save_metadata()?;
        }
        Ok(())
    }

    async fn get_book(
        &mut self,
        book: &BookId,
        position: u64,
    ) -> DeviceResult<(Box<dyn AsyncRead + Send + Unpin>, u64)> {
        let path = self.book_path(&book.lpath)?;
        let mut file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        if position > 0 {
            file.seek(SeekFrom::Start(position)).await?;
        }
        Ok((Box::new(file), size.saturating_sub(position)))
    }

    fn delete_book(&mut self, book: &BookId) -> DeviceResult<()> {
        let path = self.book_path(&book.lpath)?;
        std::fs::remove_file(&path)?;
        let _ = std::fs::remove_file(Self::sidecar_path(&path));
        self.metadata.retain(|m| m.lpath != book.lpath);
        self.save_metadata()
    }

    fn select_calibre_instance(&mut self, instances: &[CalibreInstance]) -> CalibreInstance {
        for instance in instances {
            tracing::info!(host = %instance.host, port = instance.port, name = %instance.name, "calibre instance");
        }
        instances.first().cloned().unwrap_or_default()
    }

    fn update_status(&mut self, status: Status, progress: i32) {
        if progress >= 0 {
            tracing::info!(?status, progress, "status");
        } else {
            tracing::info!(?status, "status");
        }
    }

    fn exit_signal(&mut self) -> Option<CancellationToken> {
        let token = CancellationToken::new();
        let signal = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.cancel();
            }
        });
        Some(token)
    }
}

/// Prompt for the Calibre password on stdin.
fn prompt_password() -> io::Result<String> {
    print!("Calibre password: ");
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;

    Ok(password.trim().to_string())
}

fn parse_connect(value: &str) -> anyhow::Result<CalibreInstance> {
    let (host, port) = value
        .rsplit_once(':')
        .context("expected HOST:PORT, e.g. 192.168.1.10:9090")?;
    let port: u16 = port.parse().context("invalid port")?;
    Ok(CalibreInstance {
        host: host.to_owned(),
        port,
        name: host.to_owned(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "caldev_rs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let direct_connect = match &cli.connect {
        Some(value) => Some(parse_connect(value)?),
        None => match (&file_config.host, file_config.port) {
            (Some(host), Some(port)) => Some(CalibreInstance {
                host: host.clone(),
                port,
                name: host.clone(),
            }),
            _ => None,
        },
    };

    let device_name = cli
        .name
        .or(file_config.device_name)
        .unwrap_or_else(|| "caldev".to_string());
    let options = ClientOptions {
        client_name: "caldev-rs".into(),
        device_name,
        device_model: file_config
            .device_model
            .unwrap_or_else(|| std::env::consts::OS.to_string()),
        supported_extensions: file_config
            .extensions
            .unwrap_or_else(|| vec!["epub".into(), "mobi".into()]),
        cover_dims: CoverDims {
            width: 530,
            height: 530,
        },
        direct_connect,
    };

    let library = cli
        .library
        .or(file_config.library)
        .unwrap_or_else(|| PathBuf::from("library"));
    let password = cli.password.or(file_config.password);

    tracing::info!(
        library = %library.display(),
        protocol = PROTOCOL_VERSION,
        "starting device"
    );

    let mut device = FolderDevice::open(library, options, password)?;
    let session = Session::new(&mut device, SessionConfig::default()).await?;
    session.run().await?;

    Ok(())
}
