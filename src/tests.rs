//! End-to-end tests: a scripted Calibre peer on a localhost socket talks
//! to a session backed by an in-memory mock device.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::catalog::BookDetails;
use crate::config::{ClientOptions, CoverDims, SessionConfig};
use crate::device::{BookId, Device, MetadataIter, Status};
use crate::discovery::CalibreInstance;
use crate::error::{DeviceResult, Error};
use crate::metadata::{CalibreBookMeta, CalibreTime};
use crate::protocol::{CalibreInitInfo, CalibreLibraryInfo, DeviceInfo};
use crate::session::Session;

const OK_WIRE: &[u8] = b"6[0,{}]";

async fn send_frame(stream: &mut TcpStream, op: i64, payload: Value) {
    let body = serde_json::to_vec(&json!([op, payload])).unwrap();
    let mut frame = body.len().to_string().into_bytes();
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await.unwrap();
}

async fn recv_frame(stream: &mut TcpStream) -> (i64, Value) {
    let mut prefix = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        if byte[0] == b'[' {
            break;
        }
        prefix.push(byte[0]);
    }
    let len: usize = String::from_utf8(prefix).unwrap().parse().unwrap();
    let mut body = vec![0u8; len];
    body[0] = b'[';
    stream.read_exact(&mut body[1..]).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn recv_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

/// Bind a localhost listener and run `script` against the first incoming
/// connection.
async fn start_server<F, Fut>(script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(stream).await;
    });
    (addr, handle)
}

#[derive(Default)]
struct MockDevice {
    direct: Option<CalibreInstance>,
    metadata: Vec<CalibreBookMeta>,
    files: HashMap<String, Vec<u8>>,
    deleted: Vec<String>,
    statuses: Vec<(Status, i32)>,
    password: String,
    password_requests: usize,
    updated_metadata: Vec<CalibreBookMeta>,
    library_infos: Vec<String>,
    device_infos_set: usize,
    lpath_prefix: Option<String>,
}

impl MockDevice {
    fn with_server(addr: SocketAddr) -> Self {
        Self {
            direct: Some(CalibreInstance {
                host: addr.ip().to_string(),
                port: addr.port(),
                name: "test".into(),
            }),
            ..Self::default()
        }
    }

    fn add_book(&mut self, lpath: &str, uuid: &str, content: &[u8]) {
        self.metadata.push(CalibreBookMeta {
            lpath: lpath.into(),
            uuid: uuid.into(),
            title: lpath.into(),
            authors: vec!["Author".into()],
            size: content.len() as u64,
            last_modified: CalibreTime::parse("2021-01-02T03:04:05Z"),
            ..CalibreBookMeta::default()
        });
        self.files.insert(lpath.into(), content.to_vec());
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
impl Device for MockDevice {
    fn client_options(&mut self) -> DeviceResult<ClientOptions> {
        Ok(ClientOptions {
            client_name: "test-client".into(),
            device_name: "test-device".into(),
            device_model: "mock".into(),
            supported_extensions: vec!["epub".into(), "mobi".into()],
            cover_dims: CoverDims {
                width: 530,
                height: 530,
            },
            direct_connect: self.direct.clone(),
        })
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
        let mut info = DeviceInfo::default();
        info.dev_info.device_name = "test-device".into();
        Ok(info)
    }

    fn set_device_info(&mut self, _info: DeviceInfo) -> DeviceResult<()> {
        self.device_infos_set += 1;
        Ok(())
    }

    fn set_library_info(&mut self, info: CalibreLibraryInfo) -> DeviceResult<()> {
        self.library_infos.push(info.library_name);
        Ok(())
    }

    fn update_metadata(&mut self, metadata: Vec<CalibreBookMeta>) -> DeviceResult<()> {
        self.updated_metadata.extend(metadata);
        Ok(())
    }

    async fn password(&mut self, _init: &CalibreInitInfo) -> DeviceResult<String> {
        self.password_requests += 1;
        Ok(self.password.clone())
    }

    fn free_space(&mut self) -> u64 {
        1024 * 1024 * 1024
    }

    fn check_lpath(&mut self, lpath: &str) -> String {
        match &self.lpath_prefix {
            Some(prefix) => format!("{prefix}{lpath}"),
            None => lpath.to_owned(),
        }
    }

    async fn save_book(
        &mut self,
        meta: &CalibreBookMeta,
        book: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
        _last_book: bool,
    ) -> DeviceResult<()> {
        let mut content = Vec::with_capacity(length as usize);
        book.read_to_end(&mut content).await?;
        self.files.insert(meta.lpath.clone(), content);
        self.metadata.retain(|m| m.lpath != meta.lpath);
        self.metadata.push(meta.clone());
        Ok(())
    }

    async fn get_book(
        &mut self,
        book: &BookId,
        position: u64,
    ) -> DeviceResult<(Box<dyn AsyncRead + Send + Unpin>, u64)> {
        let content = self.files.get(&book.lpath).cloned().unwrap_or_default();
        let rest = content[position as usize..].to_vec();
        let len = rest.len() as u64;
        Ok((Box::new(Cursor::new(rest)), len))
    }

    fn delete_book(&mut self, book: &BookId) -> DeviceResult<()> {
        self.files.remove(&book.lpath);
        self.metadata.retain(|m| m.lpath != book.lpath);
        self.deleted.push(book.lpath.clone());
        Ok(())
    }

    fn select_calibre_instance(&mut self, instances: &[CalibreInstance]) -> CalibreInstance {
        instances.first().cloned().unwrap_or_default()
    }

    fn update_status(&mut self, status: Status, progress: i32) {
        self.statuses.push((status, progress));
    }
}

async fn run_session(device: &mut MockDevice) -> crate::error::Result<()> {
    let session = Session::new(device, SessionConfig::default()).await?;
    session.run().await
}

#[tokio::test]
async fn keep_alive_answers_with_the_ok_frame() {
    let (addr, server) = start_server(|mut stream| async move {
        send_frame(&mut stream, 12, json!({})).await;
        assert_eq!(recv_exact(&mut stream, OK_WIRE.len()).await, OK_WIRE);
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    run_session(&mut device).await.unwrap();
    server.await.unwrap();
    assert!(device.statuses.contains(&(Status::Idle, -1)));
}

#[tokio::test]
async fn unknown_opcodes_are_tolerated() {
    let (addr, server) = start_server(|mut stream| async move {
        send_frame(&mut stream, 10, json!({})).await;
        assert_eq!(recv_exact(&mut stream, OK_WIRE.len()).await, OK_WIRE);
        send_frame(&mut stream, 42, json!({"whatever": 1})).await;
        assert_eq!(recv_exact(&mut stream, OK_WIRE.len()).await, OK_WIRE);
        // The session is still serving requests afterwards.
        send_frame(&mut stream, 12, json!({})).await;
        assert_eq!(recv_exact(&mut stream, OK_WIRE.len()).await, OK_WIRE);
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    run_session(&mut device).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn handshake_negotiates_capabilities() {
    let (addr, server) = start_server(|mut stream| async move {
        send_frame(&mut stream, 9, json!({"currentLibraryName": "Main"})).await;
        let (op, capabilities) = recv_frame(&mut stream).await;
        assert_eq!(op, 0);
        assert_eq!(capabilities["versionOK"], true);
        assert_eq!(capabilities["appName"], "test-client");
        assert_eq!(capabilities["deviceName"], "test-device");
        assert_eq!(capabilities["deviceKind"], "mock");
        assert_eq!(capabilities["ccVersionNumber"], 391);
        assert_eq!(capabilities["maxBookContentPacketLen"], 4096);
        assert_eq!(capabilities["coverHeight"], 530);
        assert_eq!(capabilities["acceptedExtensions"], json!(["epub", "mobi"]));
        assert_eq!(
            capabilities["extensionPathLengths"],
            json!({"epub": 38, "mobi": 38})
        );
        assert_eq!(capabilities["passwordHash"], "");
        assert_eq!(capabilities["cacheUsesLpaths"], true);
        assert_eq!(capabilities["canSendOkToSendbook"], true);
        assert_eq!(capabilities["canAcceptLibraryInfo"], true);

        send_frame(&mut stream, 3, json!({})).await;
        let (_, info) = recv_frame(&mut stream).await;
        assert_eq!(info["version"], "391");
        assert_eq!(info["device_version"], "mock");
        assert_eq!(info["device_info"]["device_name"], "test-device");

        send_frame(
            &mut stream,
            1,
            json!({"device_name": "renamed", "location_code": "main"}),
        )
        .await;
        assert_eq!(recv_exact(&mut stream, OK_WIRE.len()).await, OK_WIRE);

        send_frame(&mut stream, 5, json!({})).await;
        let (_, space) = recv_frame(&mut stream).await;
        assert_eq!(space["free_space_on_device"], 1024 * 1024 * 1024);

        send_frame(
            &mut stream,
            19,
            json!({"libraryName": "Main", "libraryUuid": "L1"}),
        )
        .await;
        assert_eq!(recv_exact(&mut stream, OK_WIRE.len()).await, OK_WIRE);
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    run_session(&mut device).await.unwrap();
    server.await.unwrap();
    assert_eq!(device.device_infos_set, 1);
    assert_eq!(device.library_infos, ["Main"]);
    assert!(device.statuses.contains(&(Status::Connected, -1)));
}

#[tokio::test]
async fn password_challenge_renegotiates_on_a_fresh_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        send_frame(&mut stream, 9, json!({"passwordChallenge": "abc"})).await;
        let (_, capabilities) = recv_frame(&mut stream).await;
        // Empty stored password: the hash covers the challenge alone.
        assert_eq!(
            capabilities["passwordHash"],
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        send_frame(&mut stream, 17, json!({"messageKind": 1})).await;
        assert_eq!(recv_exact(&mut stream, OK_WIRE.len()).await, OK_WIRE);
        drop(stream);

        let (mut stream, _) = listener.accept().await.unwrap();
        send_frame(&mut stream, 9, json!({"passwordChallenge": "abc"})).await;
        let (_, capabilities) = recv_frame(&mut stream).await;
        assert_eq!(
            capabilities["passwordHash"],
            "4aca87025712eb5b18a38f2a6bdd0e62c114eebb"
        );
    });

    let mut device = MockDevice::with_server(addr);
    device.password = "uncaged".into();
    run_session(&mut device).await.unwrap();
    server.await.unwrap();
    assert_eq!(device.password_requests, 1);
}

#[tokio::test]
async fn empty_password_fails_the_session() {
    let (addr, server) = start_server(|mut stream| async move {
        send_frame(&mut stream, 9, json!({"passwordChallenge": "abc"})).await;
        let _ = recv_frame(&mut stream).await;
        send_frame(&mut stream, 17, json!({"messageKind": 1})).await;
        assert_eq!(recv_exact(&mut stream, OK_WIRE.len()).await, OK_WIRE);
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    let error = run_session(&mut device).await.unwrap_err();
    assert!(matches!(error, Error::NoPassword));
    server.await.unwrap();
    assert!(device
        .statuses
        .contains(&(Status::EmptyPasswordReceived, -1)));
}

#[tokio::test]
async fn cached_book_count_streams_abridged_entries() {
    let (addr, server) = start_server(|mut stream| async move {
        send_frame(
            &mut stream,
            6,
            json!({"willUseCachedMetadata": true, "canStream": true, "canScan": true}),
        )
        .await;
        let (op, header) = recv_frame(&mut stream).await;
        assert_eq!(op, 0);
        assert_eq!(
            header,
            json!({"count": 2, "willStream": true, "willScan": true})
        );
        let (_, first) = recv_frame(&mut stream).await;
        assert_eq!(first["priKey"], 0);
        assert_eq!(first["uuid"], "U1");
        assert_eq!(first["lpath"], "a.epub");
        assert_eq!(first["extension"], ".epub");
        assert!(first["last_modified"]
            .as_str()
            .unwrap()
            .starts_with("2021-01-02T03:04:05"));
        let (_, second) = recv_frame(&mut stream).await;
        assert_eq!(second["priKey"], 1);
        assert_eq!(second["uuid"], "U2");
        assert_eq!(second["lpath"], "b/c.epub");
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    device.add_book("a.epub", "U1", b"one");
    device.add_book("b/c.epub", "U2", b"two");
    run_session(&mut device).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn full_book_count_streams_complete_metadata() {
    let (addr, server) = start_server(|mut stream| async move {
        send_frame(&mut stream, 6, json!({"willUseCachedMetadata": false})).await;
        let (_, header) = recv_frame(&mut stream).await;
        assert_eq!(header["count"], 1);
        let (_, meta) = recv_frame(&mut stream).await;
        assert_eq!(meta["lpath"], "a.epub");
        assert_eq!(meta["title"], "a.epub");
        assert_eq!(meta["authors"], json!(["Author"]));
        // Empty maps cross the wire as objects, never null.
        assert_eq!(meta["identifiers"], json!({}));
        assert_eq!(meta["user_metadata"], json!({}));
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    device.add_book("a.epub", "U1", b"one");
    run_session(&mut device).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn send_book_stores_and_streams_back() {
    let (addr, server) = start_server(|mut stream| async move {
        let metadata = json!({
            "uuid": "U", "lpath": "x.epub", "title": "X",
            "authors": ["A"], "size": 5,
        });
        send_frame(
            &mut stream,
            8,
            json!({
                "thisBook": 0, "totalBooks": 1, "length": 5, "lpath": "x.epub",
                "wantsSendOkToSendbook": true, "canSupportLpathChanges": false,
                "willStreamBinary": true, "willStreamBooks": true,
                "metadata": metadata,
            }),
        )
        .await;
        assert_eq!(recv_exact(&mut stream, OK_WIRE.len()).await, OK_WIRE);
        stream.write_all(b"hello").await.unwrap();

        send_frame(
            &mut stream,
            14,
            json!({"lpath": "x.epub", "position": 0, "canStream": true, "canStreamBinary": true}),
        )
        .await;
        let (_, header) = recv_frame(&mut stream).await;
        assert_eq!(
            header,
            json!({"willStream": true, "willStreamBinary": true, "fileLength": 5})
        );
        assert_eq!(recv_exact(&mut stream, 5).await, b"hello");
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    run_session(&mut device).await.unwrap();
    server.await.unwrap();
    assert_eq!(device.files["x.epub"], b"hello");
    assert!(device.statuses.contains(&(Status::ReceivingBook, 0)));
    assert!(device.statuses.contains(&(Status::ReceivingBook, 100)));
    assert!(device.statuses.contains(&(Status::SendingBook, -1)));
}

#[tokio::test]
async fn send_book_rewrites_the_lpath_when_supported() {
    let (addr, server) = start_server(|mut stream| async move {
        let metadata = json!({
            "uuid": "U", "lpath": "x.epub", "title": "X",
            "authors": ["A"], "size": 3,
        });
        send_frame(
            &mut stream,
            8,
            json!({
                "thisBook": 0, "totalBooks": 1, "length": 3, "lpath": "x.epub",
                "wantsSendOkToSendbook": true, "canSupportLpathChanges": true,
                "metadata": metadata,
            }),
        )
        .await;
        let (op, reply) = recv_frame(&mut stream).await;
        assert_eq!(op, 0);
        assert_eq!(reply, json!({"lpath": "books/x.epub"}));
        stream.write_all(b"abc").await.unwrap();
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    device.lpath_prefix = Some("books/".into());
    run_session(&mut device).await.unwrap();
    server.await.unwrap();
    assert_eq!(device.files["books/x.epub"], b"abc");
    assert_eq!(device.metadata[0].lpath, "books/x.epub");
}

#[tokio::test]
async fn book_segment_honors_a_position() {
    let (addr, server) = start_server(|mut stream| async move {
        send_frame(
            &mut stream,
            14,
            json!({"lpath": "y.epub", "position": 2, "canStream": true, "canStreamBinary": true}),
        )
        .await;
        let (_, header) = recv_frame(&mut stream).await;
        assert_eq!(header["fileLength"], 3);
        assert_eq!(recv_exact(&mut stream, 3).await, b"llo");
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    device.add_book("y.epub", "U2", b"hello");
    run_session(&mut device).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn delete_confirms_each_uuid_and_prunes_the_catalog() {
    let (addr, server) = start_server(|mut stream| async move {
        send_frame(&mut stream, 13, json!({"lpaths": ["a", "c"]})).await;
        assert_eq!(recv_exact(&mut stream, OK_WIRE.len()).await, OK_WIRE);
        let (_, first) = recv_frame(&mut stream).await;
        assert_eq!(first, json!({"uuid": "A"}));
        let (_, second) = recv_frame(&mut stream).await;
        assert_eq!(second, json!({"uuid": "C"}));

        // Only `b` is left in the session's catalog.
        send_frame(&mut stream, 6, json!({"willUseCachedMetadata": true})).await;
        let (_, header) = recv_frame(&mut stream).await;
        assert_eq!(header["count"], 1);
        let (_, remaining) = recv_frame(&mut stream).await;
        assert_eq!(remaining["lpath"], "b");
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    device.add_book("a", "A", b"1");
    device.add_book("b", "B", b"2");
    device.add_book("c", "C", b"3");
    run_session(&mut device).await.unwrap();
    server.await.unwrap();
    assert_eq!(device.deleted, ["a", "c"]);
    assert!(device.statuses.contains(&(Status::DeletingBook, 50)));
    assert!(device.statuses.contains(&(Status::DeletingBook, 100)));
}

#[tokio::test]
async fn deleting_an_unknown_lpath_is_fatal() {
    let (addr, server) = start_server(|mut stream| async move {
        send_frame(&mut stream, 13, json!({"lpaths": ["missing"]})).await;
        assert_eq!(recv_exact(&mut stream, OK_WIRE.len()).await, OK_WIRE);
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    let error = run_session(&mut device).await.unwrap_err();
    assert!(matches!(error, Error::ProtocolViolation(_)));
    server.await.unwrap();
}

#[tokio::test]
async fn noop_with_keys_resends_metadata() {
    let (addr, server) = start_server(|mut stream| async move {
        send_frame(&mut stream, 12, json!({"count": 1})).await;
        send_frame(&mut stream, 12, json!({"priKey": 0})).await;
        let (op, meta) = recv_frame(&mut stream).await;
        assert_eq!(op, 0);
        assert_eq!(meta["lpath"], "a.epub");
        assert_eq!(meta["uuid"], "U1");
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    device.add_book("a.epub", "U1", b"one");
    run_session(&mut device).await.unwrap();
    server.await.unwrap();
    assert!(device
        .statuses
        .contains(&(Status::SendingExtraMetadata, -1)));
}

#[tokio::test]
async fn booklists_update_reaches_the_device() {
    let (addr, server) = start_server(|mut stream| async move {
        send_frame(
            &mut stream,
            7,
            json!({"count": 2, "willStreamMetadata": true}),
        )
        .await;
        send_frame(
            &mut stream,
            16,
            json!({"count": 2, "index": 0, "data": {"lpath": "a.epub", "title": "New A"}}),
        )
        .await;
        send_frame(
            &mut stream,
            16,
            json!({"count": 2, "index": 1, "data": {"lpath": "b.epub", "title": "New B"}}),
        )
        .await;
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    device.add_book("a.epub", "U1", b"one");
    device.add_book("b.epub", "U2", b"two");
    run_session(&mut device).await.unwrap();
    server.await.unwrap();
    assert_eq!(device.updated_metadata.len(), 2);
    assert_eq!(device.updated_metadata[0].title, "New A");
    assert_eq!(device.updated_metadata[1].lpath, "b.epub");
}

#[tokio::test]
async fn booklists_with_a_wrong_opcode_is_fatal() {
    let (addr, server) = start_server(|mut stream| async move {
        send_frame(
            &mut stream,
            7,
            json!({"count": 1, "willStreamMetadata": true}),
        )
        .await;
        send_frame(&mut stream, 12, json!({})).await;
    })
    .await;

    let mut device = MockDevice::with_server(addr);
    let error = run_session(&mut device).await.unwrap_err();
    assert!(matches!(error, Error::ProtocolViolation(_)));
    server.await.unwrap();
}
