//! Connection lifecycle: discovery, handshake and the steady-state
//! request loop.
//!
//! A session owns exactly one transport and processes Calibre's requests
//! serially, in arrival order. The device collaborator is borrowed, not
//! owned; all its methods run on the session's execution path.

mod handlers;
mod transport;

use serde_json::Value;
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::config::{ClientOptions, SessionConfig};
use crate::device::{Device, Status};
use crate::discovery::{self, CalibreInstance};
use crate::error::{Error, Result};
use crate::protocol::{CalibreInitInfo, DeviceInfo, Opcode};

use transport::Transport;

/// Pessimistic transfer rate (bytes per two seconds) used to size bulk
/// deadlines.
const TRANSFER_CHUNK: u64 = 102_400;

/// Grace period Calibre gets to digest a streamed book listing.
const METADATA_GRACE: Duration = Duration::from_secs(300);

/// Protocol phase a session is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Probing the network for instances.
    Discovering,
    /// Waiting for the device to pick an instance.
    Selecting,
    /// Establishing the TCP connection.
    Connecting,
    /// Capability and password negotiation.
    Handshaking,
    /// Serving steady-state requests.
    Steady,
    /// The connection is gone.
    Closed,
}

/// One connection to one Calibre instance.
///
/// Construction snapshots the device (options, book list, drive info) and
/// locates a server; [`run`](Session::run) drives the connection until
/// Calibre disconnects, the device cancels, or a fatal error occurs.
pub struct Session<'d, D: Device + ?Sized> {
    device: &'d mut D,
    options: ClientOptions,
    config: SessionConfig,
    catalog: Catalog,
    device_info: DeviceInfo,
    init_info: CalibreInitInfo,
    server: CalibreInstance,
    password: String,
    phase: Phase,
    transfer_count: u64,
}

impl<'d, D: Device + ?Sized> Session<'d, D> {
    /// Prepare a session: snapshot the device state and locate a Calibre
    /// instance by UDP broadcast, unless the options name one directly.
    pub async fn new(device: &'d mut D, config: SessionConfig) -> Result<Self> {
        let options = device.client_options()?;
        let catalog = Catalog::new(device.device_book_list()?);
        let device_info = device.device_info()?;
        let server = match options.direct_connect.clone() {
            Some(instance) => instance,
            None => {
                device.update_status(Status::SearchingCalibre, -1);
                let instances = discovery::discover().await?;
                device.select_calibre_instance(&instances)
            }
        };
        info!(host = %server.host, port = server.port, "calibre instance selected");
        Ok(Self {
            device,
            options,
            config,
            catalog,
            device_info,
            init_info: CalibreInitInfo::default(),
            server,
            password: String::new(),
            phase: Phase::Selecting,
            transfer_count: 0,
        })
    }

    /// The phase the session is currently in.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The instance this session talks to.
    pub fn server(&self) -> &CalibreInstance {
        &self.server
    }

    /// Books the session currently believes are on the device.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Number of books transferred to the device so far.
    pub fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    /// Drive the connection until Calibre closes it, the device cancels,
    /// or a fatal error occurs. The transport is released on every exit
    /// path.
    pub async fn run(mut self) -> Result<()> {
        self.device.update_status(Status::Connecting, -1);
        self.phase = Phase::Connecting;
        let mut transport = Transport::connect(
            &self.server.host,
            self.server.port,
            self.config.standard_timeout,
        )
        .await?;
        self.phase = Phase::Handshaking;
        let cancel = self.device.exit_signal();
        let result = self.event_loop(&mut transport, cancel).await;
        self.phase = Phase::Closed;
        self.device.update_status(Status::Disconnected, -1);
        result
    }

    async fn event_loop(
        &mut self,
        transport: &mut Transport,
        cancel: Option<CancellationToken>,
    ) -> Result<()> {
        loop {
            let frame = match &cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => {
                        info!("cancellation requested, closing session");
                        return Ok(());
                    }
                    frame = transport.read_frame() => frame,
                },
                None => transport.read_frame().await,
            };
            let (opcode, payload) = match frame {
                Ok(frame) => frame,
                // EOF at the dispatch boundary is Calibre hanging up, not
                // an error.
                Err(Error::TransportClosed) => {
                    debug!("connection closed by calibre");
                    return Ok(());
                }
                Err(error) => return Err(error),
            };
            self.dispatch(transport, opcode, payload).await?;
        }
    }

    async fn dispatch(
        &mut self,
        transport: &mut Transport,
        opcode: i64,
        payload: Value,
    ) -> Result<()> {
        match Opcode::from_code(opcode) {
            Some(Opcode::GetInitializationInfo) => self.handle_init_info(transport, payload).await,
            Some(Opcode::DisplayMessage) => self.handle_display_message(transport, payload).await,
            Some(Opcode::GetDeviceInformation) => self.handle_get_device_info(transport).await,
            Some(Opcode::SetCalibreDeviceInfo) => {
                self.handle_set_device_info(transport, payload).await
            }
            Some(Opcode::FreeSpace) => self.handle_free_space(transport).await,
            Some(Opcode::GetBookCount) => self.handle_book_count(transport, payload).await,
            Some(Opcode::SendBooklists) => self.handle_send_booklists(transport, payload).await,
            Some(Opcode::SetLibraryInfo) => self.handle_set_library_info(transport, payload).await,
            Some(Opcode::SendBook) => self.handle_send_book(transport, payload).await,
            Some(Opcode::DeleteBook) => self.handle_delete_book(transport, payload).await,
            Some(Opcode::GetBookFileSegment) => self.handle_get_book(transport, payload).await,
            Some(Opcode::Noop) => self.handle_noop(transport, payload).await,
            Some(other) => {
                debug!(opcode = other.code(), "acknowledging unhandled opcode");
                transport.write_ok().await
            }
            // Tolerate opcodes newer Calibre releases may introduce.
            None => {
                debug!(opcode, "acknowledging unknown opcode");
                transport.write_ok().await
            }
        }
    }
}

/// Hex SHA-1 of the password concatenated with the challenge, the digest
/// Calibre checks.
pub(crate) fn hash_password(password: &str, challenge: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.update(challenge.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deadline for moving `length` book bytes, assuming a pessimistic
/// 100 KB/s: `max(2, 2 * ceil(length / 102400))` seconds.
pub(crate) fn transfer_deadline(length: u64) -> Duration {
    Duration::from_secs((2 * length.div_ceil(TRANSFER_CHUNK)).max(2))
}
