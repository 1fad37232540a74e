//! One handler per Calibre opcode.
//!
//! Handlers are short cooperating routines: decode the payload, talk to
//! the device, answer on the wire. A handler that reads further frames or
//! binary bytes owns the transport until it returns; nothing is pipelined
//! behind it.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::catalog::BookDetails;
use crate::device::{BookId, Device, Status};
use crate::error::{Error, Result};
use crate::protocol::{
    BookCountReceive, BookCountSend, BookListsDetails, CalibreInit, CalibreInitInfo,
    CalibreLibraryInfo, DeleteBooks, DeleteConfirmation, DevInfo, DeviceInfo, DisplayMessage,
    FreeSpace, GetBookReceive, GetBookSend, MessageKind, MetadataUpdate, NewLpath, NoopPayload,
    Opcode, SendBook, BOOK_PACKET_LEN, EXTENSION_PATH_LEN, PROTOCOL_VERSION,
};

use super::transport::Transport;
use super::{hash_password, transfer_deadline, Phase, Session, METADATA_GRACE};

/// Decode a frame payload into a typed record.
fn decode_payload<T: DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|source| Error::MalformedFrame(source.to_string()))
}

impl<D: Device + ?Sized> Session<'_, D> {
    /// Opcode 9: answer capability negotiation.
    ///
    /// A challenged first reply hashes the still-empty stored password on
    /// purpose: the server answers with a password error, the connection
    /// is dropped, and the real password is gathered without a deadline
    /// breathing down the prompt.
    pub(super) async fn handle_init_info(
        &mut self,
        transport: &mut Transport,
        payload: Value,
    ) -> Result<()> {
        self.phase = Phase::Handshaking;
        let info: CalibreInitInfo = decode_payload(payload)?;
        debug!(version = ?info.calibre_version, library = %info.current_library_name, "initialization request");
        let password_hash = if info.password_challenge.is_empty() {
            String::new()
        } else {
            hash_password(&self.password, &info.password_challenge)
        };
        let reply = CalibreInit {
            version_ok: true,
            max_book_content_packet_len: BOOK_PACKET_LEN,
            accepted_extensions: self.options.supported_extensions.clone(),
            extension_path_lengths: self
                .options
                .supported_extensions
                .iter()
                .map(|ext| (ext.clone(), EXTENSION_PATH_LEN))
                .collect(),
            password_hash,
            cc_version_number: PROTOCOL_VERSION,
            can_stream_books: true,
            can_stream_metadata: true,
            can_receive_book_binary: true,
            can_delete_multiple_books: true,
            can_use_cached_metadata: true,
            device_kind: self.options.device_model.clone(),
            cover_height: self.options.cover_dims.height,
            device_name: self.device_info.dev_info.device_name.clone(),
            app_name: self.options.client_name.clone(),
            cache_uses_lpaths: true,
            can_send_ok_to_sendbook: true,
            can_accept_library_info: true,
            ..CalibreInit::default()
        };
        self.init_info = info;
        transport.write_frame(Opcode::Ok, &reply).await
    }

    /// Opcode 17: user-facing messages. Password errors restart the
    /// handshake on a fresh connection; everything else is acknowledged.
    pub(super) async fn handle_display_message(
        &mut self,
        transport: &mut Transport,
        payload: Value,
    ) -> Result<()> {
        let message: DisplayMessage = decode_payload(payload)?;
        match MessageKind::from_code(message.message_kind) {
            Some(MessageKind::PasswordError) => self.renegotiate_password(transport).await,
            kind => {
                debug!(?kind, "display message acknowledged");
                transport.write_ok().await
            }
        }
    }

    /// Calibre rejected the password hash: acknowledge, drop the
    /// connection, gather credentials and reconnect.
    async fn renegotiate_password(&mut self, transport: &mut Transport) -> Result<()> {
        transport.write_ok().await?;
        transport.shutdown().await;
        self.phase = Phase::Connecting;
        let password = self.device.password(&self.init_info).await?;
        if password.is_empty() {
            self.device.update_status(Status::EmptyPasswordReceived, -1);
            return Err(Error::NoPassword);
        }
        self.password = password;
        *transport = Transport::connect(
            &self.server.host,
            self.server.port,
            self.config.standard_timeout,
        )
        .await?;
        self.phase = Phase::Handshaking;
        Ok(())
    }

    /// Opcode 3: present the device's drive info record.
    pub(super) async fn handle_get_device_info(&mut self, transport: &mut Transport) -> Result<()> {
        self.device.update_status(Status::Connected, -1);
        self.device_info.device_version = self.options.device_model.clone();
        self.device_info.version = PROTOCOL_VERSION.to_string();
        self.phase = Phase::Steady;
        transport.write_frame(Opcode::Ok, &self.device_info).await
    }

    /// Opcode 1: persist the drive info record Calibre pushed.
    pub(super) async fn handle_set_device_info(
        &mut self,
        transport: &mut Transport,
        payload: Value,
    ) -> Result<()> {
        let dev_info: DevInfo = decode_payload(payload)?;
        self.device.set_device_info(DeviceInfo {
            dev_info,
            ..DeviceInfo::default()
        })?;
        transport.write_ok().await
    }

    /// Opcode 5: report free storage space.
    pub(super) async fn handle_free_space(&mut self, transport: &mut Transport) -> Result<()> {
        let reply = FreeSpace {
            free_space_on_device: self.device.free_space(),
        };
        transport.write_frame(Opcode::Ok, &reply).await
    }

    /// Opcode 6: stream the book list, abridged when Calibre holds cached
    /// metadata for this device, full otherwise.
    pub(super) async fn handle_book_count(
        &mut self,
        transport: &mut Transport,
        payload: Value,
    ) -> Result<()> {
        let request: BookCountReceive = decode_payload(payload)?;
        if request.will_use_cached_metadata {
            let header = BookCountSend {
                count: self.catalog.len(),
                will_stream: true,
                will_scan: true,
            };
            transport.write_frame(Opcode::Ok, &header).await?;
            for book in self.catalog.iter() {
                transport.write_frame(Opcode::Ok, book).await?;
            }
        } else {
            let mut iter = self.device.metadata_iter(&[])?;
            let header = BookCountSend {
                count: iter.count(),
                will_stream: true,
                will_scan: true,
            };
            transport.write_frame(Opcode::Ok, &header).await?;
            while let Some(meta) = iter.next_meta() {
                transport.write_frame(Opcode::Ok, &meta?).await?;
            }
        }
        // Calibre may chew on a large listing for a while before its next
        // request.
        transport.arm_alternate(METADATA_GRACE);
        Ok(())
    }

    /// Opcode 7: receive `count` metadata records and hand them to the
    /// device.
    pub(super) async fn handle_send_booklists(
        &mut self,
        transport: &mut Transport,
        payload: Value,
    ) -> Result<()> {
        let details: BookListsDetails = decode_payload(payload)?;
        if details.count == 0 {
            return Ok(());
        }
        let mut updates = Vec::with_capacity(details.count);
        for _ in 0..details.count {
            let (opcode, value) = transport.read_frame().await?;
            if Opcode::from_code(opcode) != Some(Opcode::SendBookMetadata) {
                return Err(Error::ProtocolViolation(format!(
                    "expected a book metadata frame, got opcode {opcode}"
                )));
            }
            let update: MetadataUpdate = decode_payload(value)?;
            updates.push(update.data);
        }
        self.device.update_metadata(updates)?;
        Ok(())
    }

    /// Opcode 19: note library information.
    pub(super) async fn handle_set_library_info(
        &mut self,
        transport: &mut Transport,
        payload: Value,
    ) -> Result<()> {
        let info: CalibreLibraryInfo = decode_payload(payload)?;
        debug!(library = %info.library_name, "library info received");
        self.device.set_library_info(info)?;
        transport.write_ok().await
    }

    /// Opcode 8: receive one book binary and store it on the device.
    pub(super) async fn handle_send_book(
        &mut self,
        transport: &mut Transport,
        payload: Value,
    ) -> Result<()> {
        let mut book: SendBook = decode_payload(payload)?;
        debug!(
            lpath = %book.lpath,
            index = book.this_book,
            total = book.total_books,
            length = book.length,
            "receiving book"
        );
        if book.this_book == 0 {
            self.device.update_status(Status::ReceivingBook, 0);
        }
        let last_book = book.this_book + 1 == book.total_books;
        let checked = self.device.check_lpath(&book.lpath);
        if book.wants_send_ok_to_sendbook {
            if book.can_support_lpath_changes && checked != book.lpath {
                book.lpath = checked.clone();
                book.metadata.lpath = checked.clone();
                transport
                    .write_frame(Opcode::Ok, &NewLpath { lpath: checked })
                    .await?;
            } else {
                transport.write_ok().await?;
            }
        }
        transport.arm_alternate(transfer_deadline(book.length));
        let deadline = transport.next_deadline();
        let mut body = transport.binary_reader(book.length);
        let saved = timeout(
            deadline,
            self.device
                .save_book(&book.metadata, &mut body, book.length, last_book),
        )
        .await
        .map_err(|_| Error::TransportTimeout)?;
        let leftover = body.limit();
        drop(body);
        saved?;
        if leftover > 0 {
            // The substream must stay frame-aligned even when the device
            // read short.
            warn!(leftover, lpath = %book.metadata.lpath, "draining unread book bytes");
            let deadline = transport.standard_deadline();
            let mut rest = transport.binary_reader(leftover);
            timeout(deadline, tokio::io::copy(&mut rest, &mut tokio::io::sink()))
                .await
                .map_err(|_| Error::TransportTimeout)??;
        }
        self.catalog.insert(BookDetails::from_meta(&book.metadata));
        self.transfer_count += 1;
        if book.total_books > 0 {
            let progress = ((book.this_book + 1) * 100 / book.total_books) as i32;
            self.device.update_status(Status::ReceivingBook, progress);
        }
        Ok(())
    }

    /// Opcode 13: delete books, confirming each by UUID.
    pub(super) async fn handle_delete_book(
        &mut self,
        transport: &mut Transport,
        payload: Value,
    ) -> Result<()> {
        transport.write_ok().await?;
        let request: DeleteBooks = decode_payload(payload)?;
        let total = request.lpaths.len();
        for (index, lpath) in request.lpaths.iter().enumerate() {
            let book = self.catalog.find_by_lpath(lpath).ok_or_else(|| {
                Error::ProtocolViolation(format!("delete request for unknown lpath {lpath:?}"))
            })?;
            let id = BookId {
                lpath: book.lpath.clone(),
                uuid: book.uuid.clone(),
            };
            self.device.delete_book(&id)?;
            transport
                .write_frame(Opcode::Ok, &DeleteConfirmation { uuid: id.uuid })
                .await?;
            self.catalog.remove_by_lpath(lpath);
            let progress = ((index + 1) * 100 / total) as i32;
            self.device.update_status(Status::DeletingBook, progress);
        }
        Ok(())
    }

    /// Opcode 14: stream one book back to Calibre.
    pub(super) async fn handle_get_book(
        &mut self,
        transport: &mut Transport,
        payload: Value,
    ) -> Result<()> {
        self.device.update_status(Status::SendingBook, -1);
        let request: GetBookReceive = decode_payload(payload)?;
        if !(request.can_stream && request.can_stream_binary) {
            return Err(Error::ProtocolViolation(
                "calibre version does not support binary streaming".into(),
            ));
        }
        let book = self.catalog.find_by_lpath(&request.lpath).ok_or_else(|| {
            Error::ProtocolViolation(format!(
                "book request for unknown lpath {:?}",
                request.lpath
            ))
        })?;
        let id = BookId {
            lpath: book.lpath.clone(),
            uuid: book.uuid.clone(),
        };
        let (mut source, length) = self.device.get_book(&id, request.position).await?;
        let reply = GetBookSend {
            will_stream: true,
            will_stream_binary: true,
            file_length: length,
        };
        transport.write_frame(Opcode::Ok, &reply).await?;
        transport.arm_alternate(transfer_deadline(length));
        transport.send_binary(source.as_mut(), length).await
    }

    /// Opcode 12: keep-alive, or a request to resend metadata for a set
    /// of primary keys.
    pub(super) async fn handle_noop(
        &mut self,
        transport: &mut Transport,
        payload: Value,
    ) -> Result<()> {
        let command: NoopPayload = decode_payload(payload)?;
        let Some(count) = command.count else {
            // Keep-alive, or a noop variant this device does not know.
            self.device.update_status(Status::Idle, -1);
            return transport.write_ok().await;
        };
        if count == 0 {
            return Ok(());
        }
        self.device.update_status(Status::SendingExtraMetadata, -1);
        let mut books = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (opcode, value) = transport.read_frame().await?;
            if Opcode::from_code(opcode) != Some(Opcode::Noop) {
                return Err(Error::ProtocolViolation(format!(
                    "expected a noop frame, got opcode {opcode}"
                )));
            }
            let request: NoopPayload = decode_payload(value)?;
            let key = request
                .pri_key
                .ok_or_else(|| Error::ProtocolViolation("noop frame without a priKey".into()))?;
            let book = self
                .catalog
                .find_by_pri_key(key)
                .ok_or_else(|| Error::ProtocolViolation(format!("unknown book key {key}")))?;
            books.push(BookId {
                lpath: book.lpath.clone(),
                uuid: book.uuid.clone(),
            });
        }
        self.resend_metadata(transport, &books).await
    }

    /// Stream full metadata for `books`, e.g. after Calibre switched to a
    /// library that has no cache for this device.
    async fn resend_metadata(&mut self, transport: &mut Transport, books: &[BookId]) -> Result<()> {
        let mut iter = self.device.metadata_iter(books)?;
        if iter.count() == 0 {
            return transport.write_ok().await;
        }
        while let Some(meta) = iter.next_meta() {
            transport.write_frame(Opcode::Ok, &meta?).await?;
        }
        Ok(())
    }
}
