//! Connection to the grading server.
//!
//! [`PacketManager`] owns the socket. Reads happen on the caller's thread;
//! all writes after the handshake go through one sender thread that drains
//! a FIFO queue, so any thread may enqueue packets through a [`PacketSender`].

use super::codec::{read_packet, write_frame};
use super::packets::{InboundPacket, OutboundPacket};
use crate::config::types::{JudgeConfig, JudgeError, Result};
use crate::executors::ExecutorVersions;
use crate::observability::audit;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use nix::sys::socket::{setsockopt, sockopt};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};

enum Outgoing {
    Packet(OutboundPacket),
    Shutdown,
}

/// Enqueues packets for the sender thread
#[derive(Clone)]
pub struct PacketSender {
    queue: Sender<Outgoing>,
}

impl PacketSender {
    /// Never blocks; packets queued after the connection died are dropped
    pub fn send(&self, packet: OutboundPacket) {
        let name = packet.name();
        if self.queue.send(Outgoing::Packet(packet)).is_err() {
            warn!("connection closed, dropping {} packet", name);
        }
    }
}

/// Cuts the connection from another thread, failing a blocked `recv`
pub struct ConnectionInterrupter {
    stream: TcpStream,
}

impl ConnectionInterrupter {
    pub fn interrupt(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

pub struct PacketManager {
    server: String,
    stream: TcpStream,
    queue: Sender<Outgoing>,
    pending: Option<Receiver<Outgoing>>,
    sender_thread: Option<JoinHandle<()>>,
}

impl PacketManager {
    /// Connect and handshake. The sender thread is not running yet.
    pub fn connect(config: &JudgeConfig, problems: &[(String, f64)], executors: ExecutorVersions) -> Result<Self> {
        let server = format!("[{}]:{}", config.server_host, config.server_port);
        info!("Opening connection to: {}", server);
        let stream = open_stream(config)?;
        stream.set_read_timeout(config.read_timeout())?;
        setsockopt(&stream, sockopt::KeepAlive, &true)?;

        let (queue, pending) = unbounded();
        let mut manager = Self {
            server,
            stream,
            queue,
            pending: Some(pending),
            sender_thread: None,
        };
        manager.handshake(config, problems, executors)?;
        Ok(manager)
    }

    fn handshake(&mut self, config: &JudgeConfig, problems: &[(String, f64)], executors: ExecutorVersions) -> Result<()> {
        info!("Starting handshake with: {}", self.server);
        let packet = OutboundPacket::Handshake {
            problems: problems.to_vec(),
            executors,
            id: config.judge_name.clone(),
            key: config.judge_key.clone(),
        };
        write_frame(&mut self.stream, &packet)?;

        info!("Awaiting handshake response: {}", self.server);
        match read_packet(&mut self.stream) {
            Ok(InboundPacket::HandshakeSuccess {}) => {
                info!("Judge \"{}\" online: {}", config.judge_name, self.server);
                Ok(())
            }
            Ok(other) => {
                audit::handshake_rejected(&self.server);
                Err(JudgeError::Protocol(format!("handshake failed, server replied `{}`", other.name())))
            }
            Err(e) => {
                error!("Cannot understand handshake response from {}: {}", self.server, e);
                audit::handshake_rejected(&self.server);
                Err(JudgeError::Protocol(format!("handshake failed: {}", e)))
            }
        }
    }

    /// Spawn the writer thread; packets queued before now go out first
    pub fn start_sender(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let mut stream = self.stream.try_clone()?;
        let server = self.server.clone();
        let handle = thread::Builder::new().name("packet-sender".to_string()).spawn(move || {
            for outgoing in pending.iter() {
                let packet = match outgoing {
                    Outgoing::Packet(packet) => packet,
                    Outgoing::Shutdown => break,
                };
                debug!("sending {} packet", packet.name());
                if let Err(e) = write_frame(&mut stream, &packet) {
                    error!("failed to send {} packet to {}: {}", packet.name(), server, e);
                    // Unblocks the reader so the judge notices the loss
                    let _ = stream.shutdown(Shutdown::Both);
                    break;
                }
            }
            debug!("packet sender for {} stopped", server);
        })?;
        self.sender_thread = Some(handle);
        Ok(())
    }

    pub fn sender(&self) -> PacketSender {
        PacketSender {
            queue: self.queue.clone(),
        }
    }

    pub fn interrupter(&self) -> Result<ConnectionInterrupter> {
        Ok(ConnectionInterrupter {
            stream: self.stream.try_clone()?,
        })
    }

    pub fn lazy_send(&self, packet: OutboundPacket) {
        self.sender().send(packet);
    }

    /// Block until the next packet. A read timeout or a closed socket is an error.
    pub fn recv(&self) -> Result<InboundPacket> {
        read_packet(&mut &self.stream)
    }

    /// Flush queued packets, stop the writer and shut the socket
    pub fn close(&mut self) {
        let _ = self.queue.send(Outgoing::Shutdown);
        if let Some(handle) = self.sender_thread.take() {
            if handle.join().is_err() {
                error!("packet sender panicked");
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        info!("Connection to {} closed", self.server);
    }
}

impl Drop for PacketManager {
    fn drop(&mut self) {
        if self.sender_thread.is_some() {
            self.close();
        }
    }
}

fn open_stream(config: &JudgeConfig) -> Result<TcpStream> {
    let addrs = (config.server_host.as_str(), config.server_port).to_socket_addrs()?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("connecting to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(e) => JudgeError::Io(e),
        None => JudgeError::Config(format!("`{}` did not resolve to any address", config.server_host)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{decode_body, read_frame};
    use std::collections::BTreeMap;
    use std::net::TcpListener;

    fn config_for(listener: &TcpListener) -> JudgeConfig {
        JudgeConfig {
            server_host: "127.0.0.1".to_string(),
            server_port: listener.local_addr().unwrap().port(),
            judge_name: "box-1".to_string(),
            judge_key: "secret".to_string(),
            ..JudgeConfig::default()
        }
    }

    fn read_value(stream: &mut TcpStream) -> serde_json::Value {
        decode_body(&read_frame(stream).unwrap()).unwrap()
    }

    #[test]
    fn test_handshake_then_fifo_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let handshake = read_value(&mut stream);
            write_frame(&mut stream, &serde_json::json!({"name": "handshake-success"})).unwrap();
            let first = read_value(&mut stream);
            let second = read_value(&mut stream);
            (handshake, first, second)
        });

        let problems = vec![("sum-ab".to_string(), 1700000000.0)];
        let mut manager = PacketManager::connect(&config, &problems, BTreeMap::new()).unwrap();
        manager.lazy_send(OutboundPacket::SubmissionAcknowledged { submission_id: 1 });
        manager.start_sender().unwrap();
        manager.sender().send(OutboundPacket::GradingEnd { submission_id: 1 });
        manager.close();

        let (handshake, first, second) = server.join().unwrap();
        assert_eq!(handshake["name"], "handshake");
        assert_eq!(handshake["id"], "box-1");
        assert_eq!(handshake["problems"][0][0], "sum-ab");
        assert_eq!(first["name"], "submission-acknowledged");
        assert_eq!(second["name"], "grading-end");
    }

    #[test]
    fn test_rejected_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_value(&mut stream);
            write_frame(&mut stream, &serde_json::json!({"name": "handshake-failure"})).unwrap();
        });
        let result = PacketManager::connect(&config, &[], BTreeMap::new());
        assert!(matches!(result, Err(JudgeError::Protocol(_))));
        server.join().unwrap();
    }
}
