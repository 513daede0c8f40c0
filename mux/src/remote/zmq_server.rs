//! ZMQ REQ/REP control endpoint (behind the `zmq-remote` feature):
//! JSON request frames `{ "command": ..., "args": {...}, "auth": ... }`
//! answered in request order per connection, as REQ/REP guarantees.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use failure::Error;
use log::{info, warn};
use serde_json::{json, Value};

use super::CommandProcessor;

pub struct ZmqServer;

impl ZmqServer {
    /// Binds the REP socket (e.g. "tcp://*:9000") and serves until the
    /// shutdown flag rises.
    pub fn spawn(
        endpoint: &str,
        processor: Arc<CommandProcessor>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<std::thread::JoinHandle<()>, Error> {
        let context = zmq::Context::new();
        let socket = context
            .socket(zmq::REP)
            .map_err(|e| failure::format_err!("zmq socket: {}", e))?;
        socket
            .bind(endpoint)
            .map_err(|e| failure::format_err!("zmq bind {}: {}", endpoint, e))?;
        socket
            .set_rcvtimeo(500)
            .map_err(|e| failure::format_err!("zmq timeout: {}", e))?;
        info!("zmq control listening on {}", endpoint);
        let endpoint = endpoint.to_owned();
        let handle = std::thread::Builder::new()
            .name("zmq-control".to_owned())
            .spawn(move || serve(socket, &endpoint, processor, shutdown))?;
        Ok(handle)
    }
}

fn serve(
    socket: zmq::Socket,
    endpoint: &str,
    processor: Arc<CommandProcessor>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let message = match socket.recv_string(0) {
            Ok(Ok(m)) => m,
            Ok(Err(_)) => {
                let _ = socket.send("{\"success\":false,\"error\":\"invalid UTF-8\"}", 0);
                continue;
            }
            Err(zmq::Error::EAGAIN) => continue,
            Err(e) => {
                warn!("zmq receive error on {}: {}", endpoint, e);
                continue;
            }
        };
        let response = handle_message(&processor, &message);
        if let Err(e) = socket.send(&response.to_string(), 0) {
            warn!("zmq send error on {}: {}", endpoint, e);
        }
    }
}

fn handle_message(processor: &CommandProcessor, message: &str) -> Value {
    let request: Value = match serde_json::from_str(message) {
        Ok(v) => v,
        Err(e) => return json!({"success": false, "error": format!("bad request: {}", e)}),
    };
    let command = match request.get("command").and_then(Value::as_str) {
        Some(c) => c,
        None => return json!({"success": false, "error": "missing command"}),
    };
    let args = request.get("args").cloned().unwrap_or_else(|| json!({}));
    let auth = request.get("auth").and_then(Value::as_str);
    processor.execute("zmq", "zmq-peer", command, &args, auth)
}
