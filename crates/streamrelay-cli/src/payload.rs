//! Where the relayed payload comes from.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::task::JoinHandle;

use streamrelay_engine::{ChunkSource, ReaderSource};

use crate::fetch;

/// Payload origin selected on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadOrigin {
    Stdin,
    File(PathBuf),
    Url(String),
}

impl PayloadOrigin {
    /// `-` and a missing `--input` both mean stdin; a URL wins over both.
    pub fn from_args(input: Option<&Path>, url: Option<&str>) -> Self {
        match (url, input) {
            (Some(url), _) => Self::Url(url.to_owned()),
            (None, Some(path)) if path != Path::new("-") => Self::File(path.to_path_buf()),
            _ => Self::Stdin,
        }
    }
}

impl fmt::Display for PayloadOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => f.write_str("-"),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Url(url) => f.write_str(url),
        }
    }
}

/// An opened payload, ready to hand to the relay.
pub struct Payload {
    pub source: Box<dyn ChunkSource + Send>,
    /// Reported by the server for URL payloads.
    pub content_type: Option<String>,
    /// Background download feeding `source`, if any.
    pub download: Option<JoinHandle<()>>,
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("content_type", &self.content_type)
            .field("streaming", &self.download.is_some())
            .finish_non_exhaustive()
    }
}

impl Payload {
    pub async fn open(origin: &PayloadOrigin, chunk_size: usize) -> anyhow::Result<Self> {
        match origin {
            PayloadOrigin::Stdin => Ok(Self::from_reader(io::stdin(), chunk_size)),
            PayloadOrigin::File(path) => {
                let file = File::open(path)
                    .with_context(|| format!("Failed to open payload {}", path.display()))?;
                Ok(Self::from_reader(file, chunk_size))
            }
            PayloadOrigin::Url(url) => {
                let client = fetch::build_client()?;
                let body = fetch::fetch(&client, url).await?;
                Ok(Self {
                    source: Box::new(body.source),
                    content_type: body.content_type,
                    download: Some(body.task),
                })
            }
        }
    }

    fn from_reader<R>(reader: R, chunk_size: usize) -> Self
    where
        R: Read + Send + 'static,
    {
        Self {
            source: Box::new(ReaderSource::new(reader, chunk_size)),
            content_type: None,
            download: None,
        }
    }
}
