// End-to-end wire protocol tests: a real server on a real socket,
// driven with hand-built frames.

use std::rc::Rc;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::LocalSet;

use emberdb::config::{Config, IndexConfig, IndexStructure, KeyType, SpaceConfig};
use emberdb::server::{Mode, Server};

const MSG_INSERT: u32 = 13;
const MSG_SELECT: u32 = 17;
const MSG_UPDATE: u32 = 19;
const MSG_DELETE: u32 = 21;
const MSG_PING: u32 = 0xff00;
const FLAG_RETURN_TUPLE: u32 = 0x01;
const FLAG_ADD: u32 = 0x02;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut cfg = Config::default();
    cfg.listen_port = free_port();
    cfg.admin_port = 0;
    cfg.replication_port = 0;
    cfg.wal_dir = dir.path().join("wal");
    cfg.snap_dir = dir.path().join("snap");
    cfg.spaces.push(SpaceConfig {
        id: 0,
        enabled: true,
        cardinality: 0,
        indexes: vec![IndexConfig {
            key_field: 0,
            key_type: KeyType::Num,
            unique: true,
            structure: IndexStructure::Hash,
        }],
    });
    cfg
}

async fn start_server(cfg: Config) -> Rc<Server> {
    let server = Server::new(cfg);
    server.startup().await.expect("server startup");
    server
}

fn put_tuple(out: &mut BytesMut, fields: &[&[u8]]) {
    out.put_u32_le(fields.len() as u32);
    for field in fields {
        assert!(field.len() < 128);
        out.put_u8(field.len() as u8);
        out.put_slice(field);
    }
}

fn frame(msg_code: u32, sync: u32, body: &[u8]) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u32_le(msg_code);
    out.put_u32_le(body.len() as u32);
    out.put_u32_le(sync);
    out.put_slice(body);
    out
}

fn insert_frame(sync: u32, space: u32, flags: u32, fields: &[&[u8]]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32_le(space);
    body.put_u32_le(flags);
    put_tuple(&mut body, fields);
    frame(MSG_INSERT, sync, &body)
}

fn select_frame(sync: u32, space: u32, key: &[u8]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32_le(space);
    body.put_u32_le(0); // index
    body.put_u32_le(0); // offset
    body.put_u32_le(1); // limit
    body.put_u32_le(1); // key count
    put_tuple(&mut body, &[key]);
    frame(MSG_SELECT, sync, &body)
}

struct Reply {
    sync: u32,
    ret_code: u32,
    body: BytesMut,
}

async fn roundtrip(stream: &mut TcpStream, request: &[u8]) -> Reply {
    stream.write_all(request).await.unwrap();
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).await.unwrap();
    let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    let sync = u32::from_le_bytes(header[8..12].try_into().unwrap());
    let ret_code = u32::from_le_bytes(header[12..16].try_into().unwrap());
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await.unwrap();
    Reply {
        sync,
        ret_code,
        body: BytesMut::from(&body[..]),
    }
}

#[tokio::test]
async fn ping_is_a_bare_header_echo() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let server = start_server(test_config(&dir)).await;
            let mut stream = TcpStream::connect(server.client_addr().unwrap())
                .await
                .unwrap();

            let request = [
                0x00, 0xff, 0x00, 0x00, // msg = 0xff00
                0x00, 0x00, 0x00, 0x00, // len = 0
                0x2a, 0x00, 0x00, 0x00, // sync = 42
            ];
            stream.write_all(&request).await.unwrap();
            let mut reply = [0u8; 12];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, request);

            server.request_stop(0);
            server.finalize();
        })
        .await;
}

#[tokio::test]
async fn insert_then_select_returns_the_tuple() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let server = start_server(test_config(&dir)).await;
            let mut stream = TcpStream::connect(server.client_addr().unwrap())
                .await
                .unwrap();

            let key = 1u32.to_le_bytes();
            let insert = insert_frame(7, 0, 0, &[&key, b"hello"]);
            let reply = roundtrip(&mut stream, &insert).await;
            assert_eq!(reply.sync, 7);
            assert_eq!(reply.ret_code, 0);
            let mut body = reply.body;
            assert_eq!(body.get_u32_le(), 1); // count

            let select = select_frame(8, 0, &key);
            let mut reply = roundtrip(&mut stream, &select).await;
            assert_eq!(reply.sync, 8);
            assert_eq!(reply.ret_code, 0);
            assert_eq!(reply.body.get_u32_le(), 1); // count
            let bsize = reply.body.get_u32_le();
            assert_eq!(reply.body.get_u32_le(), 2); // field count
            let mut packed = reply.body.split_to(bsize as usize);
            assert_eq!(packed.get_u8(), 4);
            assert_eq!(packed.split_to(4).as_ref(), key);
            assert_eq!(packed.get_u8(), 5);
            assert_eq!(packed.as_ref(), b"hello");

            // A key nobody inserted comes back empty.
            let miss = select_frame(9, 0, &2u32.to_le_bytes());
            let mut reply = roundtrip(&mut stream, &miss).await;
            assert_eq!(reply.ret_code, 0);
            assert_eq!(reply.body.get_u32_le(), 0);

            server.request_stop(0);
            server.finalize();
        })
        .await;
}

#[tokio::test]
async fn duplicate_insert_with_add_reports_node_found() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let server = start_server(test_config(&dir)).await;
            let mut stream = TcpStream::connect(server.client_addr().unwrap())
                .await
                .unwrap();

            let key = 1u32.to_le_bytes();
            let first = roundtrip(&mut stream, &insert_frame(1, 0, FLAG_ADD, &[&key, b"v"])).await;
            assert_eq!(first.ret_code, 0);
            let dup = roundtrip(&mut stream, &insert_frame(2, 0, FLAG_ADD, &[&key, b"v"])).await;
            assert_eq!(dup.ret_code, 0x3702);
            assert!(dup.body.is_empty());

            server.request_stop(0);
            server.finalize();
        })
        .await;
}

#[tokio::test]
async fn update_and_delete_lifecycle() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let server = start_server(test_config(&dir)).await;
            let mut stream = TcpStream::connect(server.client_addr().unwrap())
                .await
                .unwrap();

            let key = 5u32.to_le_bytes();
            let reply = roundtrip(&mut stream, &insert_frame(1, 0, 0, &[&key, b"hello"])).await;
            assert_eq!(reply.ret_code, 0);

            // ASSIGN field 1 = "world", returning the new tuple.
            let mut body = BytesMut::new();
            body.put_u32_le(0);
            body.put_u32_le(FLAG_RETURN_TUPLE);
            put_tuple(&mut body, &[&key]);
            body.put_u32_le(1); // one op
            body.put_u32_le(1); // field 1
            body.put_u8(0); // ASSIGN
            body.put_u8(5);
            body.put_slice(b"world");
            let mut reply = roundtrip(&mut stream, &frame(MSG_UPDATE, 2, &body)).await;
            assert_eq!(reply.ret_code, 0);
            assert_eq!(reply.body.get_u32_le(), 1);
            let bsize = reply.body.get_u32_le() as usize;
            assert_eq!(reply.body.get_u32_le(), 2);
            let packed = reply.body.split_to(bsize);
            assert!(packed.ends_with(b"world"));

            // DELETE with flags (opcode 21).
            let mut body = BytesMut::new();
            body.put_u32_le(0);
            body.put_u32_le(0);
            put_tuple(&mut body, &[&key]);
            let reply = roundtrip(&mut stream, &frame(MSG_DELETE, 3, &body)).await;
            assert_eq!(reply.ret_code, 0);

            // Second delete of the same key: not found.
            let mut body = BytesMut::new();
            body.put_u32_le(0);
            body.put_u32_le(0);
            put_tuple(&mut body, &[&key]);
            let reply = roundtrip(&mut stream, &frame(MSG_DELETE, 4, &body)).await;
            assert_eq!(reply.ret_code, 0x3102);

            server.request_stop(0);
            server.finalize();
        })
        .await;
}

#[tokio::test]
async fn oversized_request_is_rejected_without_disconnect() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = test_config(&dir);
            cfg.readahead = 1024;
            let server = start_server(cfg).await;
            let mut stream = TcpStream::connect(server.client_addr().unwrap())
                .await
                .unwrap();

            let huge = vec![0u8; 4096];
            let reply = roundtrip(&mut stream, &frame(MSG_INSERT, 11, &huge)).await;
            assert_eq!(reply.sync, 11);
            assert_eq!(reply.ret_code, 0x0202);

            // The connection survives and keeps serving.
            let request = frame(MSG_PING, 12, &[]);
            stream.write_all(&request).await.unwrap();
            let mut pong = [0u8; 12];
            stream.read_exact(&mut pong).await.unwrap();
            assert_eq!(&pong[..], &request[..]);

            server.request_stop(0);
            server.finalize();
        })
        .await;
}

#[tokio::test]
async fn read_only_mode_rejects_mutations() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let server = start_server(test_config(&dir)).await;
            let mut stream = TcpStream::connect(server.client_addr().unwrap())
                .await
                .unwrap();

            let key = 3u32.to_le_bytes();
            let reply = roundtrip(&mut stream, &insert_frame(1, 0, 0, &[&key, b"v"])).await;
            assert_eq!(reply.ret_code, 0);

            // Swap the dispatch table; the next request sees it.
            server.set_mode(Mode::ReadOnly);
            let reply = roundtrip(&mut stream, &insert_frame(2, 0, 0, &[&key, b"w"])).await;
            assert_eq!(reply.ret_code, 0x0102); // NONMASTER

            // Reads still work.
            let mut reply = roundtrip(&mut stream, &select_frame(3, 0, &key)).await;
            assert_eq!(reply.ret_code, 0);
            assert_eq!(reply.body.get_u32_le(), 1);

            server.request_stop(0);
            server.finalize();
        })
        .await;
}

#[tokio::test]
async fn call_invokes_builtin_procedures() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let server = start_server(test_config(&dir)).await;
            let mut stream = TcpStream::connect(server.client_addr().unwrap())
                .await
                .unwrap();

            for key in 1..=3u32 {
                let reply =
                    roundtrip(&mut stream, &insert_frame(key, 0, 0, &[&key.to_le_bytes(), b"v"]))
                        .await;
                assert_eq!(reply.ret_code, 0);
            }

            // CALL box.select_range(0, 0, 10)
            let mut body = BytesMut::new();
            body.put_u32_le(0); // flags
            let name = b"box.select_range";
            body.put_u8(name.len() as u8);
            body.put_slice(name);
            put_tuple(
                &mut body,
                &[&0u32.to_le_bytes(), &0u32.to_le_bytes(), &10u32.to_le_bytes()],
            );
            let mut reply = roundtrip(&mut stream, &frame(22, 9, &body)).await;
            assert_eq!(reply.ret_code, 0);
            assert_eq!(reply.body.get_u32_le(), 3);

            // Unknown procedure name fails with ILLEGAL_PARAMS.
            let mut body = BytesMut::new();
            body.put_u32_le(0);
            let name = b"box.nonexistent";
            body.put_u8(name.len() as u8);
            body.put_slice(name);
            put_tuple(&mut body, &[]);
            let reply = roundtrip(&mut stream, &frame(22, 10, &body)).await;
            assert_eq!(reply.ret_code, 0x0202);

            server.request_stop(0);
            server.finalize();
        })
        .await;
}

#[tokio::test]
async fn unknown_space_reports_no_such_namespace() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let server = start_server(test_config(&dir)).await;
            let mut stream = TcpStream::connect(server.client_addr().unwrap())
                .await
                .unwrap();

            let key = 1u32.to_le_bytes();
            let reply = roundtrip(&mut stream, &insert_frame(1, 99, 0, &[&key, b"v"])).await;
            assert_eq!(reply.ret_code, 0x3902);

            server.request_stop(0);
            server.finalize();
        })
        .await;
}
