// Admin console: a line-oriented text protocol on its own port.
// Replies are YAML-ish and always end with a `...` line.

use std::net::SocketAddr;
use std::rc::Rc;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::DbError;
use crate::net::{bread, write_all};
use crate::server::{Mode, Server};
use crate::snapshot;

const GREETING: &str = "EmberDB admin console\n";

pub async fn admin_loop(server: Rc<Server>, mut stream: TcpStream, peer: SocketAddr) {
    debug!(%peer, "admin connected");
    if write_all(&mut stream, GREETING.as_bytes()).await.is_err() {
        return;
    }
    let mut rbuf = crate::buf::new_buf();
    loop {
        let line = match read_line(&mut stream, &mut rbuf).await {
            Ok(line) => line,
            Err(DbError::ConnectionClosed) => break,
            Err(e) => {
                warn!(%peer, error = %e, "admin read failed");
                break;
            }
        };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if matches!(command, "quit" | "exit") {
            break;
        }
        let reply = execute(&server, command).await;
        let framed = format!("---\n{reply}...\n");
        if write_all(&mut stream, framed.as_bytes()).await.is_err() {
            break;
        }
    }
    debug!(%peer, "admin disconnected");
}

async fn read_line(stream: &mut TcpStream, rbuf: &mut BytesMut) -> crate::error::Result<String> {
    loop {
        if let Some(pos) = rbuf.iter().position(|&b| b == b'\n') {
            let line = rbuf.split_to(pos + 1);
            return Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        let want = rbuf.len() + 1;
        bread(stream, rbuf, want).await?;
    }
}

async fn execute(server: &Rc<Server>, command: &str) -> String {
    match command {
        "save snapshot" => match snapshot::save(server).await {
            Ok(lsn) => format!("snapshot:\n  lsn: {lsn}\n  status: saved\n"),
            Err(e) => format!("error: \"{e}\"\n"),
        },
        "show info" => show_info(server),
        "show stat" => server.stat.render(),
        "reload configuration" => match server.cfg.borrow().check() {
            Ok(()) => "status: reloaded\n".to_string(),
            Err(e) => format!("error: \"{e}\"\n"),
        },
        "help" => "available commands:\n  save snapshot\n  show info\n  show stat\n  reload configuration\n  lua EXPR\n  quit\n"
            .to_string(),
        _ if command.starts_with("lua ") => lua_eval(server, &command[4..]),
        other => {
            info!(command = other, "unknown admin command");
            "error: \"unknown command, try help\"\n".to_string()
        }
    }
}

fn show_info(server: &Rc<Server>) -> String {
    let status = match server.mode() {
        Mode::ReadWrite => "primary",
        Mode::ReadOnly => "replica",
    };
    let mut out = String::from("info:\n");
    out.push_str(&format!("  version: \"{}\"\n", crate::VERSION));
    out.push_str(&format!("  status: {status}\n"));
    out.push_str(&format!("  lsn: {}\n", server.lsn()));
    out.push_str(&format!("  confirmed_lsn: {}\n", server.confirmed_lsn()));
    out.push_str(&format!("  uptime: {}\n", server.stat.uptime_secs()));
    let mut total = 0usize;
    for space in server.spaces.all() {
        total += space.tuple_count();
    }
    out.push_str(&format!("  tuples: {total}\n"));
    out
}

/// The seam the scripting runtime hooks into. Expressions are routed
/// to a registered `box.dostring` procedure when one exists.
fn lua_eval(server: &Rc<Server>, expr: &str) -> String {
    let mut builder = crate::tuple::TupleBuilder::new();
    builder.add_field(expr.as_bytes());
    let args = builder.finish();
    match server.procs.call(server, b"box.dostring", &args) {
        Ok(tuples) => {
            let mut out = String::from("result:\n");
            for tuple in tuples {
                out.push_str(&format!("  - {tuple:?}\n"));
            }
            out
        }
        Err(_) => "error: \"Lua runtime is not attached\"\n".to_string(),
    }
}
