//! Third-level bridge: connects this instance's manager to the mediator
//! that pairs it with a peer instance. Control traffic is exchanged as
//! length-delimited text tokens, one token per frame; the sparse-grid
//! images travel as raw bytes on a separate data connection, their sizes
//! announced as decimal tokens on the control channel.

pub mod mediator;

use crate::config::ThirdLevelConfig;
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub(crate) type ControlChannel = Framed<TcpStream, LengthDelimitedCodec>;

pub(crate) async fn send_token(control: &mut ControlChannel, token: &str) -> Result<()> {
    control
        .send(Bytes::from(token.as_bytes().to_vec()))
        .await
        .map_err(|e| Error::Protocol(format!("control send failed: {}", e)))
}

pub(crate) async fn recv_token(
    control: &mut ControlChannel,
    limit: Duration,
) -> Result<String> {
    let frame = tokio::time::timeout(limit, control.next())
        .await
        .map_err(|_| Error::Timeout("waiting for control token".into()))?
        .ok_or_else(|| Error::Protocol("control channel closed".into()))?
        .map_err(|e| Error::Protocol(format!("control receive failed: {}", e)))?;
    String::from_utf8(frame.to_vec())
        .map_err(|_| Error::Protocol("control token is not valid text".into()))
}

/// Manager-side client of the mediator. All methods block; a
/// current-thread runtime drives the async endpoints internally, so the
/// SPMD side of the program stays synchronous.
pub struct ThirdLevelBridge {
    // sockets are declared before the runtime so they deregister first
    control: ControlChannel,
    data: TcpStream,
    timeout: Duration,
    system_name: String,
    runtime: tokio::runtime::Runtime,
}

impl ThirdLevelBridge {
    /// Connects the control channel, announces the system name and opens
    /// the data connection once the mediator asks for it.
    pub fn connect(cfg: &ThirdLevelConfig) -> Result<ThirdLevelBridge> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let limit = cfg.timeout;

        let (control, data) = runtime.block_on(async {
            log::info!(
                "connecting to third-level mediator at {} (control port {}, data port {})",
                cfg.host,
                cfg.broker_port,
                cfg.data_port
            );
            let stream = tokio::time::timeout(
                limit,
                TcpStream::connect((cfg.host.as_str(), cfg.broker_port)),
            )
            .await
            .map_err(|_| Error::Timeout("connecting control channel".into()))??;
            let mut control = Framed::new(stream, LengthDelimitedCodec::new());

            send_token(&mut control, &cfg.system_name).await?;
            send_token(&mut control, "ready").await?;

            let instruction = recv_token(&mut control, limit).await?;
            if instruction != "create_data_conn" {
                return Err(Error::Protocol(format!(
                    "expected create_data_conn, got '{}'",
                    instruction
                )));
            }
            let data = tokio::time::timeout(
                limit,
                TcpStream::connect((cfg.host.as_str(), cfg.data_port)),
            )
            .await
            .map_err(|_| Error::Timeout("connecting data channel".into()))??;
            Ok::<_, Error>((control, data))
        })?;

        Ok(ThirdLevelBridge {
            control,
            data,
            timeout: limit,
            system_name: cfg.system_name.clone(),
            runtime,
        })
    }

    pub fn system_name(&self) -> &str {
        &self.system_name
    }

    /// One combine handshake: offer the own image, receive the peer's.
    pub fn exchange(&mut self, image: &[u8]) -> Result<Vec<u8>> {
        let limit = self.timeout;
        let control = &mut self.control;
        let data = &mut self.data;
        self.runtime.block_on(async {
            send_token(control, "ready_to_combine").await?;
            let instruction = recv_token(control, limit).await?;
            if instruction != "do_combine" {
                return Err(Error::Protocol(format!(
                    "expected do_combine, got '{}'",
                    instruction
                )));
            }

            send_token(control, "sending_data").await?;
            send_token(control, &image.len().to_string()).await?;
            tokio::time::timeout(limit, data.write_all(image))
                .await
                .map_err(|_| Error::Timeout("writing sparse grid image".into()))??;

            let size_token = recv_token(control, limit).await?;
            let size: usize = size_token.parse().map_err(|_| {
                Error::Protocol(format!("expected a decimal byte count, got '{}'", size_token))
            })?;
            let mut peer = vec![0u8; size];
            tokio::time::timeout(limit, data.read_exact(&mut peer))
                .await
                .map_err(|_| Error::Timeout("reading peer sparse grid image".into()))??;
            Ok(peer)
        })
    }

    /// Tells the mediator that this instance has finished computing.
    /// Best effort; failures are only logged.
    pub fn finalize(&mut self) {
        let control = &mut self.control;
        let result = self
            .runtime
            .block_on(async { send_token(control, "finished_computation").await });
        if let Err(e) = result {
            log::warn!("could not announce finished_computation: {}", e);
        }
    }
}
