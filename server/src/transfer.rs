//! Moving files between the server and gateways.
//!
//! Gateways run an FTP daemon. Every push or pull opens its own session; the
//! blocking client runs on the blocking pool so the event loops never stall on it.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use suppaftp::types::FileType;
use suppaftp::FtpStream;

use crate::config::FtpConfig;

/// Node type whose images live in a directory named after the sketch.
const SKETCH_NODETYPE: &str = "UNO";
const IMAGES_DIR: &str = "images";
const ERASE_DIR: &str = "erase";

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("FTP error: {0}")]
    Ftp(#[from] suppaftp::FtpError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Transfer task failed: {0}")]
    Task(String),
}

/// File exchange with a gateway at `host`.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Store a file in the gateway's root directory.
    async fn push_file(&self, host: &str, local: &Path) -> Result<(), TransferError>;

    /// Store a firmware image where the gateway's flasher for `nodetype_id` looks.
    async fn push_image(
        &self,
        host: &str,
        local: &Path,
        nodetype_id: &str,
    ) -> Result<(), TransferError>;

    /// Store an image used to wipe nodes.
    async fn push_erase_image(&self, host: &str, local: &Path) -> Result<(), TransferError>;

    /// Fetch `<gateway_id>.xml` into `dest_dir`, returning the local path.
    async fn pull_descriptor(
        &self,
        host: &str,
        gateway_id: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, TransferError>;
}

fn file_name(path: &Path) -> Result<String, TransferError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::InvalidPath(path.display().to_string()))
}

/// Sketch directory: the file name up to its first dot.
fn sketch_dir(path: &Path) -> Result<String, TransferError> {
    let name = file_name(path)?;
    match name.split('.').next() {
        Some(dir) if !dir.is_empty() => Ok(dir.to_string()),
        _ => Err(TransferError::InvalidPath(path.display().to_string())),
    }
}

/// Remote directories, outermost first, that receive a firmware image.
pub fn image_dirs(local: &Path, nodetype_id: &str) -> Result<Vec<String>, TransferError> {
    let mut dirs = vec![IMAGES_DIR.to_string()];
    if nodetype_id == SKETCH_NODETYPE {
        dirs.push(sketch_dir(local)?);
    }
    Ok(dirs)
}

/// Remote directories, outermost first, that receive an erase image.
pub fn erase_dirs(local: &Path) -> Result<Vec<String>, TransferError> {
    let mut dirs = vec![IMAGES_DIR.to_string(), ERASE_DIR.to_string()];
    if local.extension().is_some_and(|ext| ext == "ino") {
        dirs.push(sketch_dir(local)?);
    }
    Ok(dirs)
}

fn enter(ftp: &mut FtpStream, dir: &str) -> Result<(), TransferError> {
    if ftp.cwd(dir).is_err() {
        ftp.mkdir(dir)?;
        ftp.cwd(dir)?;
    }
    Ok(())
}

fn upload(ftp: &mut FtpStream, dirs: &[String], local: &Path) -> Result<(), TransferError> {
    let name = file_name(local)?;
    let mut file = File::open(local)?;
    for dir in dirs {
        enter(ftp, dir)?;
    }
    ftp.put_file(&name, &mut file)?;
    Ok(())
}

/// [`FileTransfer`] over plain FTP.
#[derive(Debug, Clone)]
pub struct FtpTransfer {
    port: u16,
    username: String,
    password: String,
}

impl FtpTransfer {
    pub fn new(config: &FtpConfig) -> Self {
        Self {
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    async fn session<T, F>(&self, host: &str, work: F) -> Result<T, TransferError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T, TransferError> + Send + 'static,
    {
        let addr = format!("{}:{}", host, self.port);
        let username = self.username.clone();
        let password = self.password.clone();

        tokio::task::spawn_blocking(move || {
            let mut ftp = FtpStream::connect(&addr)?;
            ftp.login(&username, &password)?;
            ftp.transfer_type(FileType::Binary)?;
            let result = work(&mut ftp);
            if let Err(e) = ftp.quit() {
                tracing::debug!(addr = %addr, "FTP quit failed: {}", e);
            }
            result
        })
        .await
        .map_err(|e| TransferError::Task(e.to_string()))?
    }
}

#[async_trait]
impl FileTransfer for FtpTransfer {
    async fn push_file(&self, host: &str, local: &Path) -> Result<(), TransferError> {
        let local = local.to_path_buf();
        self.session(host, move |ftp| upload(ftp, &[], &local)).await?;
        tracing::debug!(host = %host, "Pushed reference file");
        Ok(())
    }

    async fn push_image(
        &self,
        host: &str,
        local: &Path,
        nodetype_id: &str,
    ) -> Result<(), TransferError> {
        let dirs = image_dirs(local, nodetype_id)?;
        let local = local.to_path_buf();
        self.session(host, move |ftp| upload(ftp, &dirs, &local)).await?;
        tracing::debug!(host = %host, nodetype = %nodetype_id, "Pushed image");
        Ok(())
    }

    async fn push_erase_image(&self, host: &str, local: &Path) -> Result<(), TransferError> {
        let dirs = erase_dirs(local)?;
        let local = local.to_path_buf();
        self.session(host, move |ftp| upload(ftp, &dirs, &local)).await
    }

    async fn pull_descriptor(
        &self,
        host: &str,
        gateway_id: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, TransferError> {
        let remote = format!("{}.xml", gateway_id);
        let dest = dest_dir.join(&remote);
        std::fs::create_dir_all(dest_dir)?;

        let data = self
            .session(host, move |ftp| Ok(ftp.retr_as_buffer(&remote)?.into_inner()))
            .await?;
        std::fs::write(&dest, data)?;
        Ok(dest)
    }
}
