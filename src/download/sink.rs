// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Local side of a transfer: where the streamed bytes end up.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// How a destination file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fresh attempt: the file must not exist yet
    CreateNew,
    /// Reconnect: keep the partial file and write after it
    Append,
}

/// Storage for downloaded files.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Make sure the destination directory exists.
    async fn prepare_dir(&self, dir: &Path) -> io::Result<()>;

    async fn exists(&self, path: &Path) -> io::Result<bool>;

    async fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn SinkWriter>>;
}

/// An open destination file.
#[async_trait]
pub trait SinkWriter: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Flush and release the handle.
    async fn close(self: Box<Self>) -> io::Result<()>;
}

/// Writes transfers to the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSink;

#[async_trait]
impl Sink for FileSink {
    async fn prepare_dir(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir).await
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        fs::try_exists(path).await
    }

    async fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn SinkWriter>> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::CreateNew => options.write(true).create_new(true),
            OpenMode::Append => options.append(true).create(true),
        };
        let file = options.open(path).await?;
        Ok(Box::new(FileWriter { file }))
    }
}

struct FileWriter {
    file: File,
}

#[async_trait]
impl SinkWriter for FileWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        // tokio buffers the write on a blocking thread until flushed
        self.file.flush().await
    }

    async fn close(mut self: Box<Self>) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_new_refuses_existing_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("taken.bin");
        std::fs::write(&path, b"old").unwrap();

        let err = match FileSink.open(&path, OpenMode::CreateNew).await {
            Ok(_) => panic!("create-new should refuse an existing file"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&path).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_append_keeps_partial_content() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().join("nested").join("dir");
        FileSink.prepare_dir(&dir).await.unwrap();
        let path = dir.join("part.bin");

        let mut writer = FileSink.open(&path, OpenMode::CreateNew).await.unwrap();
        writer.write_chunk(b"abc").await.unwrap();
        writer.close().await.unwrap();

        let mut writer = FileSink.open(&path, OpenMode::Append).await.unwrap();
        writer.write_chunk(b"def").await.unwrap();
        writer.close().await.unwrap();

        assert!(FileSink.exists(&path).await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }
}
