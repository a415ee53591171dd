#![allow(dead_code)]

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use russ::Connection;
use russ::Listener;
use russ::RussConfig;
use russ::Server;
use tempfile::TempDir;

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn ids() -> (u32, u32) {
    // SAFETY: trivial libc getters.
    unsafe { (libc::getuid(), libc::getgid()) }
}

pub fn announce(path: &Path) -> Listener {
    let (uid, gid) = ids();
    Listener::announce(path, 0o600, uid, gid).expect("announce")
}

pub fn with_timeout<F, T>(duration: Duration, f: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = f();
        let _ = tx.send(result);
    });
    rx.recv_timeout(duration).ok()
}

/// Reads slot `index` to EOF.
pub fn read_slot(conn: &mut Connection, index: usize) -> String {
    let fd = conn.take_descriptor(index).unwrap().expect("slot present");
    let mut out = String::new();
    File::from(fd).read_to_string(&mut out).unwrap();
    out
}

pub fn write_slot(conn: &mut Connection, index: usize, text: &str) {
    let fd = conn.take_descriptor(index).unwrap().expect("slot present");
    File::from(fd).write_all(text.as_bytes()).unwrap();
}

/// Test service: `echo` copies stdin to stdout, `help`/`list` print fixed
/// text, `whoami` prints the request, anything else fails on stderr.
pub fn test_handler(conn: &mut Connection) -> i32 {
    let request = conn.request().unwrap().clone();
    match request.operation.as_str() {
        "echo" => {
            let input = read_slot(conn, 0);
            write_slot(conn, 1, &input);
            0
        }
        "help" => {
            write_slot(conn, 1, "usage: echo | whoami\n");
            0
        }
        "list" => {
            write_slot(conn, 1, "echo\nhelp\nlist\nwhoami\n");
            0
        }
        "whoami" => {
            let attrs: Vec<String> = request
                .attributes
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            let text = format!(
                "{} {} [{}] [{}]",
                request.service_path,
                request.operation,
                attrs.join(","),
                request.arguments.join(",")
            );
            write_slot(conn, 1, &text);
            0
        }
        "crash" => panic!("requested crash"),
        other => {
            write_slot(conn, 2, &format!("unknown operation {}", other));
            1
        }
    }
}

/// A listener served by [`test_handler`] on a background thread.
pub struct ServiceHarness {
    pub dir: TempDir,
    pub path: PathBuf,
    pub config: RussConfig,
    server: Server,
    thread: Option<thread::JoinHandle<russ::Result<()>>>,
}

impl ServiceHarness {
    pub fn start(workers: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc");
        let config = RussConfig::default()
            .with_services_dir(dir.path())
            .with_workers(workers)
            .with_answer_tick(Duration::from_millis(20));

        let listener = Arc::new(announce(&path).with_config(&config));
        let server = Server::new(&config);
        let runner = server.clone();
        let thread = thread::spawn(move || runner.run(&*listener, test_handler));

        Self {
            dir,
            path,
            config,
            server,
            thread: Some(thread),
        }
    }

    pub fn addr(&self) -> String {
        self.path.display().to_string()
    }

    pub fn stop(mut self) -> russ::Result<()> {
        self.join()
    }

    fn join(&mut self) -> russ::Result<()> {
        self.server.shutdown_flag().store(true, Ordering::SeqCst);
        match self.thread.take() {
            Some(handle) => handle.join().expect("server thread panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for ServiceHarness {
    fn drop(&mut self) {
        let _ = self.join();
    }
}
