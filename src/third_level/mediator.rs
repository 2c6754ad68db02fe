//! Out-of-band mediator pairing two system instances. Accepts one control
//! and one data connection per system, drives the combine handshake and
//! bridges the two byte streams.

use super::{recv_token, send_token, ControlChannel};
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

struct System {
    name: String,
    control: ControlChannel,
    data: TcpStream,
}

pub struct Mediator {
    // listeners are declared before the runtime so they deregister first
    control_listener: TcpListener,
    data_listener: TcpListener,
    timeout: Duration,
    runtime: tokio::runtime::Runtime,
}

impl Mediator {
    /// Binds both listeners; port 0 picks free ports, the actual addresses
    /// are available through `control_addr` / `data_addr`.
    pub fn bind(control_addr: &str, data_addr: &str, timeout: Duration) -> Result<Mediator> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let (control_listener, data_listener) = runtime.block_on(async {
            let c = TcpListener::bind(control_addr).await?;
            let d = TcpListener::bind(data_addr).await?;
            Ok::<_, std::io::Error>((c, d))
        })?;
        Ok(Mediator { control_listener, data_listener, timeout, runtime })
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.control_listener.local_addr()?)
    }

    pub fn data_addr(&self) -> Result<SocketAddr> {
        Ok(self.data_listener.local_addr()?)
    }

    /// Serves exactly one pairing of two systems until both announce
    /// `finished_computation`.
    pub fn run(self) -> Result<()> {
        let timeout = self.timeout;
        let control_listener = self.control_listener;
        let data_listener = self.data_listener;
        self.runtime.block_on(async {
            let mut systems = Vec::with_capacity(2);
            for _ in 0..2 {
                let system = accept_system(&control_listener, &data_listener, timeout).await?;
                log::info!("system '{}' registered with the mediator", system.name);
                systems.push(system);
            }
            let mut second = systems.pop().ok_or_else(|| Error::Protocol("no system".into()))?;
            let mut first = systems.pop().ok_or_else(|| Error::Protocol("no system".into()))?;
            serve_pair(&mut first, &mut second, timeout).await
        })
    }
}

async fn accept_system(
    control_listener: &TcpListener,
    data_listener: &TcpListener,
    timeout: Duration,
) -> Result<System> {
    let (stream, addr) = tokio::time::timeout(timeout, control_listener.accept())
        .await
        .map_err(|_| Error::Timeout("waiting for a system to connect".into()))??;
    log::debug!("control connection from {}", addr);
    let mut control = Framed::new(stream, LengthDelimitedCodec::new());

    let name = recv_token(&mut control, timeout).await?;
    let ready = recv_token(&mut control, timeout).await?;
    if ready != "ready" {
        return Err(Error::Protocol(format!("system '{}' sent '{}' instead of ready", name, ready)));
    }

    // the next accepted data connection belongs to this system
    send_token(&mut control, "create_data_conn").await?;
    let (data, _) = tokio::time::timeout(timeout, data_listener.accept())
        .await
        .map_err(|_| Error::Timeout(format!("waiting for data connection of '{}'", name)))??;

    Ok(System { name, control, data })
}

async fn serve_pair(a: &mut System, b: &mut System, timeout: Duration) -> Result<()> {
    loop {
        let token_a = recv_token(&mut a.control, timeout).await?;
        let token_b = recv_token(&mut b.control, timeout).await?;

        if token_a == "finished_computation" || token_b == "finished_computation" {
            log::info!("a system finished, releasing both");
            let _ = send_token(&mut a.control, "exit").await;
            let _ = send_token(&mut b.control, "exit").await;
            return Ok(());
        }
        if token_a != "ready_to_combine" || token_b != "ready_to_combine" {
            return Err(Error::Protocol(format!(
                "unexpected tokens '{}' / '{}' from '{}' / '{}'",
                token_a, token_b, a.name, b.name
            )));
        }

        send_token(&mut a.control, "do_combine").await?;
        send_token(&mut b.control, "do_combine").await?;

        // drain both inbound images before forwarding anything, so neither
        // sender can stall on a full socket buffer
        let image_a = read_image(a, timeout).await?;
        let image_b = read_image(b, timeout).await?;
        log::debug!(
            "bridging {} bytes from '{}' and {} bytes from '{}'",
            image_a.len(),
            a.name,
            image_b.len(),
            b.name
        );
        write_image(a, &image_b, timeout).await?;
        write_image(b, &image_a, timeout).await?;
    }
}

async fn read_image(system: &mut System, timeout: Duration) -> Result<Vec<u8>> {
    let announce = recv_token(&mut system.control, timeout).await?;
    if announce != "sending_data" {
        return Err(Error::Protocol(format!(
            "system '{}' sent '{}' instead of sending_data",
            system.name, announce
        )));
    }
    let size_token = recv_token(&mut system.control, timeout).await?;
    let size: usize = size_token.parse().map_err(|_| {
        Error::Protocol(format!(
            "system '{}' announced a non-decimal size '{}'",
            system.name, size_token
        ))
    })?;
    let mut image = vec![0u8; size];
    tokio::time::timeout(timeout, system.data.read_exact(&mut image))
        .await
        .map_err(|_| Error::Timeout(format!("reading image of '{}'", system.name)))??;
    Ok(image)
}

async fn write_image(system: &mut System, image: &[u8], timeout: Duration) -> Result<()> {
    send_token(&mut system.control, &image.len().to_string()).await?;
    tokio::time::timeout(timeout, system.data.write_all(image))
        .await
        .map_err(|_| Error::Timeout(format!("forwarding image to '{}'", system.name)))??;
    Ok(())
}
