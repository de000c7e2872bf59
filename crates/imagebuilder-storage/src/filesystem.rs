//! Shared streaming write path for the local and shared-volume backends.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};

use crate::StorageError;

/// Stream `reader` into `target`, creating parent directories as needed.
/// The destination is written directly (no temp file); a failed copy removes
/// the partial file before surfacing the error.
pub(crate) async fn stream_to_file<R>(
    target: &Path,
    mut reader: R,
) -> Result<(PathBuf, u64), StorageError>
where
    R: AsyncRead + Unpin + Send,
{
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    let file = fs::File::create(target).await?;
    let mut writer = BufWriter::new(file);

    let copied = match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(n) => n,
        Err(err) => {
            drop(writer);
            let _ = fs::remove_file(target).await;
            return Err(err.into());
        }
    };

    if let Err(err) = writer.flush().await {
        let _ = fs::remove_file(target).await;
        return Err(err.into());
    }
    let file = writer.into_inner();
    if let Err(err) = file.sync_all().await {
        let _ = fs::remove_file(target).await;
        return Err(err.into());
    }

    Ok((target.to_path_buf(), copied))
}
