//! In-memory ring of the most recent log lines.
//!
//! Plugs into `tracing_subscriber::fmt` as a writer so the lines match what
//! the console would show. Each line is prefixed with the window role: `#`
//! for the authorization window, `*` for a framed document.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::registry::LookupSpan;

pub const BLACKBOX_CAPACITY: usize = 200;

struct Ring {
    prefix: String,
    lines: VecDeque<String>,
}

#[derive(Clone)]
pub struct BlackBox {
    ring: Arc<Mutex<Ring>>,
}

impl BlackBox {
    #[must_use]
    pub fn new(auth_window: bool, framed: bool) -> Self {
        let prefix = format!(
            "{}{}crossframe: ",
            if auth_window { "#" } else { "" },
            if framed { "*" } else { "" }
        );
        Self {
            ring: Arc::new(Mutex::new(Ring {
                prefix,
                lines: VecDeque::with_capacity(BLACKBOX_CAPACITY),
            })),
        }
    }

    fn ring(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A plain-text fmt layer writing into this box.
    #[must_use]
    pub fn layer<S>(&self) -> fmt::Layer<S, DefaultFields, Format, Self>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(self.clone())
    }

    pub fn push(&self, line: &str) {
        let mut ring = self.ring();
        if ring.lines.len() >= BLACKBOX_CAPACITY {
            ring.lines.pop_front();
        }
        let line = format!("{}{line}", ring.prefix);
        ring.lines.push_back(line);
    }

    /// The newest `limit` lines (all of them when `None`), oldest first.
    #[must_use]
    pub fn last(&self, limit: Option<usize>) -> String {
        let ring = self.ring();
        let skip = limit.map_or(0, |limit| ring.lines.len().saturating_sub(limit));
        ring.lines
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring().lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Buffers one formatted event and files it on drop.
pub struct BlackBoxWriter {
    target: BlackBox,
    buf: Vec<u8>,
}

impl io::Write for BlackBoxWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            self.target.push(line);
        }
        Ok(())
    }
}

impl Drop for BlackBoxWriter {
    fn drop(&mut self) {
        let _ = io::Write::flush(self);
    }
}

impl<'a> MakeWriter<'a> for BlackBox {
    type Writer = BlackBoxWriter;

    fn make_writer(&'a self) -> Self::Writer {
        BlackBoxWriter {
            target: self.clone(),
            buf: Vec::new(),
        }
    }
}
