use std::io::{BufReader, Read};
use std::process::Stdio;
use std::sync::mpsc;
use std::time::Instant;

use tracing::{debug, info};

use crate::cli::command::CommandLine;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr as received, one line per analyzer line.
    pub output: String,
}

impl Invocation {
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            output: output.into(),
        }
    }
}

/// Runs analyzer command lines. The build worker calls this once per target GPU
/// and blocks until the call returns.
pub trait ProcessInvoker: Send + Sync {
    fn invoke(&self, cmd: &CommandLine) -> Result<Invocation>;
}

/// Spawns the analyzer as a child process with stdin detached.
///
/// There is no timeout and no mid-process kill: a child that never exits
/// keeps the calling thread blocked.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInvoker;

impl ProcessInvoker for SystemInvoker {
    fn invoke(&self, cmd: &CommandLine) -> Result<Invocation> {
        info!(command = %cmd, "launching analyzer");
        let start = Instant::now();

        let mut child = cmd
            .to_process()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to launch '{}': {e}", cmd.program)))?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(out, tx)));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(err, tx)));
        }
        drop(tx);

        let mut output = String::new();
        for line in rx {
            output.push_str(&line);
            output.push('\n');
        }
        for r in readers {
            let _ = r.join();
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        debug!(
            status = %status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "analyzer exited"
        );
        Ok(Invocation {
            success: status.success(),
            exit_code: status.code(),
            output,
        })
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            if *b == b'\n' {
                let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                pending.clear();
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}
