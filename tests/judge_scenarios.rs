//! End-to-end judge sessions against a fake server.
//!
//! The server side runs on a thread and speaks raw frames. Workers run
//! in-process, mostly as scripted bodies; none of them launch a sandbox.

use judgebox::config::types::JudgeConfig;
use judgebox::judge::Judge;
use judgebox::protocol::{decode_frame, read_frame, write_frame, PacketManager};
use judgebox::verdict::{ResultFlags, TestResult};
use judgebox::worker::ipc::{read_message, write_message};
use judgebox::worker::{IpcMessage, ThreadSpawner, WorkerRequest};
use judgebox::JudgeError;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct FakeServer {
    stream: TcpStream,
}

impl FakeServer {
    fn send(&mut self, packet: Value) {
        write_frame(&mut self.stream, &packet).unwrap();
    }

    fn recv(&mut self) -> Value {
        let body = read_frame(&mut self.stream).unwrap();
        let frame = [(body.len() as u32).to_be_bytes().to_vec(), body].concat();
        decode_frame(&frame).unwrap()
    }

    /// Read until a packet named `name` arrives; returns it and everything before it
    fn until(&mut self, name: &str) -> (Value, Vec<String>) {
        let mut seen = Vec::new();
        loop {
            let packet = self.recv();
            let packet_name = packet["name"].as_str().unwrap_or_default().to_string();
            if packet_name == name {
                return (packet, seen);
            }
            seen.push(packet_name);
        }
    }

    /// Poll `get-current-submission` until the judge reports idle
    fn wait_idle(&mut self) {
        for _ in 0..100 {
            self.send(json!({"name": "get-current-submission"}));
            let (reply, _) = self.until("current-submission-id");
            if reply["submission-id"].is_null() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("judge never went idle");
    }
}

fn submission(id: u64) -> Value {
    json!({
        "name": "submission-request",
        "submission-id": id,
        "problem-id": "sum-ab",
        "language": "PY3",
        "source": "print(sum(map(int, input().split())))",
        "time-limit": 2.0,
        "memory-limit": 65536,
    })
}

/// Accept one judge, answer its handshake, then hand the socket to `script`
fn fake_server(script: impl FnOnce(&mut FakeServer) + Send + 'static) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(20))).unwrap();
        let mut server = FakeServer { stream };
        let handshake = server.recv();
        assert_eq!(handshake["name"], "handshake");
        assert_eq!(handshake["id"], "box-1");
        server.send(json!({"name": "handshake-success"}));
        script(&mut server);
    });
    (port, handle)
}

fn config(port: u16) -> JudgeConfig {
    JudgeConfig {
        server_host: "127.0.0.1".to_string(),
        server_port: port,
        judge_name: "box-1".to_string(),
        judge_key: "secret".to_string(),
        ..JudgeConfig::default()
    }
}

/// Counts spawns and plays `messages` once the grade request arrives.
/// With `wait_for_abort`, the worker stalls after the script until aborted.
fn scripted(messages: Vec<IpcMessage>, wait_for_abort: bool, spawned: Arc<AtomicUsize>) -> ThreadSpawner {
    ThreadSpawner::new(move |mut stream: UnixStream| {
        spawned.fetch_add(1, Ordering::SeqCst);
        let mut reader = stream.try_clone().unwrap();
        let _: Option<WorkerRequest> = read_message(&mut reader).unwrap();
        for message in &messages {
            if write_message(&mut stream, message).is_err() {
                return;
            }
        }
        if wait_for_abort {
            loop {
                match read_message::<_, WorkerRequest>(&mut reader) {
                    Ok(Some(WorkerRequest::Abort)) => break,
                    Ok(Some(_)) => continue,
                    _ => return,
                }
            }
            let _ = write_message(&mut stream, &IpcMessage::GradingAborted);
        }
        let _ = write_message(&mut stream, &IpcMessage::Bye);
        while let Ok(Some(request)) = read_message::<_, WorkerRequest>(&mut reader) {
            if request == WorkerRequest::Close {
                break;
            }
        }
    })
}

fn run_judge(port: u16, spawner: ThreadSpawner, worker_timeout: Duration) -> (Judge, judgebox::Result<()>) {
    let config = config(port);
    let mut judge = Judge::new(config.clone(), Arc::new(spawner))
        .with_worker_timeout(worker_timeout)
        .with_reap_grace(Duration::from_secs(2));
    let packets = PacketManager::connect(&config, &[("sum-ab".to_string(), 0.0)], BTreeMap::new()).unwrap();
    let outcome = judge.run(packets);
    (judge, outcome)
}

#[test]
fn test_accepted_submission_reports_every_stage() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let result = TestResult {
        position: 0,
        result_flag: ResultFlags::empty(),
        execution_time: 0.01,
        max_memory: 1024,
        points: 1.0,
        total_points: 1.0,
        ..TestResult::default()
    };
    let spawner = scripted(
        vec![
            IpcMessage::Hello,
            IpcMessage::GradingBegin { pretested: false },
            IpcMessage::Result {
                result: Box::new(result),
            },
            IpcMessage::GradingEnd,
        ],
        false,
        spawned.clone(),
    );
    let (port, server) = fake_server(|server| {
        server.send(submission(1));
        let (ack, _) = server.until("submission-acknowledged");
        assert_eq!(ack["submission-id"], 1);
        let (status, seen) = server.until("test-case-status");
        assert_eq!(seen, vec!["grading-begin"]);
        assert_eq!(status["cases"][0]["position"], 0);
        assert_eq!(status["cases"][0]["status"], 0);
        assert_eq!(status["cases"][0]["memory"], 1024);
        server.until("grading-end");
        server.wait_idle();
        server.send(json!({"name": "disconnect"}));
    });

    let (judge, outcome) = run_judge(port, spawner, Duration::from_secs(10));
    server.join().unwrap();
    assert!(outcome.is_ok());
    assert!(!judge.is_grading());
    assert_eq!(spawned.load(Ordering::SeqCst), 1);
    assert_eq!(judge.metrics().submissions_accepted.get(), 1);
}

#[test]
fn test_busy_judge_rejects_without_spawning() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let spawner = scripted(
        vec![IpcMessage::Hello, IpcMessage::GradingBegin { pretested: false }],
        true,
        spawned.clone(),
    );
    let (port, server) = fake_server(|server| {
        server.send(submission(1));
        server.until("grading-begin");

        server.send(submission(2));
        let (rejection, seen) = server.until("internal-error");
        assert_eq!(rejection["submission-id"], 2);
        assert!(!seen.contains(&"submission-acknowledged".to_string()));

        server.send(json!({"name": "get-current-submission"}));
        let (current, _) = server.until("current-submission-id");
        assert_eq!(current["submission-id"], 1);

        server.send(json!({"name": "terminate-submission", "submission-id": 1}));
        server.until("submission-terminated");
        server.wait_idle();
        server.send(json!({"name": "disconnect"}));
    });

    let (judge, outcome) = run_judge(port, spawner, Duration::from_secs(10));
    server.join().unwrap();
    assert!(outcome.is_ok());
    assert_eq!(spawned.load(Ordering::SeqCst), 1);
    assert_eq!(judge.metrics().submissions_rejected_busy.get(), 1);
    assert_eq!(judge.metrics().submissions_terminated.get(), 1);
}

#[test]
fn test_hung_worker_is_killed_and_the_judge_recovers() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let counter = spawned.clone();
    // Says hello, then never speaks again
    let spawner = ThreadSpawner::new(move |mut stream: UnixStream| {
        counter.fetch_add(1, Ordering::SeqCst);
        let mut reader = stream.try_clone().unwrap();
        let _ = write_message(&mut stream, &IpcMessage::Hello);
        while let Ok(Some(_)) = read_message::<_, WorkerRequest>(&mut reader) {}
    });
    let (port, server) = fake_server(|server| {
        server.send(submission(7));
        server.until("submission-acknowledged");
        let (failure, _) = server.until("internal-error");
        assert_eq!(failure["submission-id"], 7);

        server.send(json!({"name": "ping", "when": 12.5}));
        let (pong, _) = server.until("ping-response");
        assert_eq!(pong["when"], 12.5);

        server.wait_idle();
        server.send(submission(8));
        let (ack, _) = server.until("submission-acknowledged");
        assert_eq!(ack["submission-id"], 8);
        server.send(json!({"name": "disconnect"}));
    });

    let (judge, outcome) = run_judge(port, spawner, Duration::from_millis(300));
    server.join().unwrap();
    assert!(outcome.is_ok());
    assert!(!judge.is_grading());
    assert_eq!(spawned.load(Ordering::SeqCst), 2);
    assert!(judge.metrics().workers_force_killed.get() >= 1);
}

#[test]
fn test_terminate_after_grading_end_is_harmless() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let spawner = scripted(
        vec![
            IpcMessage::Hello,
            IpcMessage::GradingBegin { pretested: true },
            IpcMessage::GradingEnd,
        ],
        false,
        spawned,
    );
    let (port, server) = fake_server(|server| {
        server.send(submission(3));
        server.until("grading-end");
        server.send(json!({"name": "terminate-submission", "submission-id": 3}));
        server.send(json!({"name": "terminate-submission"}));
        server.wait_idle();
        server.send(json!({"name": "ping", "when": 1.0}));
        server.until("ping-response");
        server.send(json!({"name": "disconnect"}));
    });

    let (judge, outcome) = run_judge(port, spawner, Duration::from_secs(10));
    server.join().unwrap();
    assert!(outcome.is_ok());
    assert!(!judge.is_grading());
    assert_eq!(judge.metrics().submissions_terminated.get(), 0);
}

#[test]
fn test_unknown_problem_is_acknowledged_then_reported() {
    let (port, server) = fake_server(|server| {
        server.send(submission(9));
        let (ack, _) = server.until("submission-acknowledged");
        assert_eq!(ack["submission-id"], 9);
        let (failure, seen) = server.until("internal-error");
        assert_eq!(failure["submission-id"], 9);
        assert!(!seen.contains(&"grading-begin".to_string()));
        server.wait_idle();
        server.send(json!({"name": "disconnect"}));
    });

    let (judge, outcome) = run_judge(port, ThreadSpawner::serving(), Duration::from_secs(30));
    server.join().unwrap();
    assert!(outcome.is_ok());
    assert!(!judge.is_grading());
}

#[test]
fn test_unknown_packets_are_ignored() {
    let spawner = scripted(Vec::new(), false, Arc::new(AtomicUsize::new(0)));
    let (port, server) = fake_server(|server| {
        server.send(json!({"name": "future-feature", "value": 1}));
        server.send(json!({"name": "ping", "when": 2.0}));
        server.until("ping-response");
        server.send(json!({"name": "disconnect"}));
    });

    let (_judge, outcome) = run_judge(port, spawner, Duration::from_secs(10));
    server.join().unwrap();
    assert!(outcome.is_ok());
}

#[test]
fn test_malformed_known_packet_keeps_the_session() {
    let spawner = scripted(Vec::new(), false, Arc::new(AtomicUsize::new(0)));
    let (port, server) = fake_server(|server| {
        server.send(json!({"name": "ping", "when": "yesterday"}));
        server.send(json!({"name": "terminate-submission", "submission-id": "five"}));
        server.send(json!({"name": "ping", "when": 4.5}));
        let (reply, before) = server.until("ping-response");
        assert_eq!(reply["when"], json!(4.5));
        assert!(before.is_empty(), "unexpected replies {:?}", before);
        server.send(json!({"name": "disconnect"}));
    });

    let (_judge, outcome) = run_judge(port, spawner, Duration::from_secs(10));
    server.join().unwrap();
    assert!(outcome.is_ok());
}

#[test]
fn test_server_hangup_is_an_error() {
    let spawner = scripted(Vec::new(), false, Arc::new(AtomicUsize::new(0)));
    let (port, server) = fake_server(|server| {
        server.stream.shutdown(std::net::Shutdown::Both).unwrap();
    });

    let (judge, outcome) = run_judge(port, spawner, Duration::from_secs(10));
    server.join().unwrap();
    assert!(matches!(outcome, Err(JudgeError::Protocol(_)) | Err(JudgeError::Io(_))));
    assert!(!judge.is_grading());
}
