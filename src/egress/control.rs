//! Circuit renewal over onion-router control sockets

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use super::EgressControl;
use crate::types::{Result, ScanError};

/// One control socket per proxy
pub struct ControlSockets {
    sockets: HashMap<String, PathBuf>,
    password: Option<String>,
}

impl ControlSockets {
    pub fn new(sockets: HashMap<String, PathBuf>, password: Option<String>) -> Self {
        Self { sockets, password }
    }

    /// Parse `proxy=socket` pairs
    pub fn parse_pairs(pairs: &[String]) -> std::result::Result<HashMap<String, PathBuf>, String> {
        pairs
            .iter()
            .map(|pair| {
                pair.split_once('=')
                    .map(|(proxy, socket)| (proxy.trim().to_string(), PathBuf::from(socket.trim())))
                    .ok_or_else(|| format!("expected proxy=socket, got '{}'", pair))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

/// Send one command and require a `250` reply
async fn command(
    reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    line: &str,
) -> Result<()> {
    writer.write_all(format!("{}\r\n", line).as_bytes()).await?;
    let mut reply = String::new();
    reader.read_line(&mut reply).await?;
    if reply.starts_with("250") {
        Ok(())
    } else {
        Err(ScanError::Transport(format!(
            "control socket rejected command: {}",
            reply.trim()
        )))
    }
}

#[async_trait]
impl EgressControl for ControlSockets {
    async fn rotate(&self, path: &str) -> Result<()> {
        let socket = self
            .sockets
            .get(path)
            .ok_or_else(|| ScanError::Internal(format!("no control socket for {}", path)))?;

        let stream = UnixStream::connect(socket).await?;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let auth = match &self.password {
            Some(password) => format!("AUTHENTICATE \"{}\"", password.replace('"', "\\\"")),
            None => "AUTHENTICATE".to_string(),
        };
        command(&mut reader, &mut write, &auth).await?;
        command(&mut reader, &mut write, "SIGNAL NEWNYM").await?;
        if let Err(e) = write.write_all(b"QUIT\r\n").await {
            debug!(proxy = path, error = %e, "Control socket closed before QUIT");
        }

        debug!(proxy = path, socket = %socket.display(), "Requested new circuit");
        Ok(())
    }
}
