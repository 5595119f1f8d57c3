//! Destinations for the human-readable field trace.

use std::io::Write;

/// Receives one line per decoded field or set. Lines carry no trailing newline.
pub trait TraceSink {
    fn line(&mut self, line: &str);
}

impl TraceSink for Vec<String> {
    fn line(&mut self, line: &str) {
        self.push(line.to_string());
    }
}

/// Writes trace lines to any `Write`, newline-terminated.
///
/// Write errors are remembered rather than returned so a broken trace file
/// never interrupts decoding; check [`WriterSink::take_error`] afterwards.
pub struct WriterSink<W: Write> {
    inner: W,
    error: Option<std::io::Error>,
}

impl<W: Write> WriterSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, error: None }
    }

    pub fn take_error(&mut self) -> Option<std::io::Error> {
        self.error.take()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> TraceSink for WriterSink<W> {
    fn line(&mut self, line: &str) {
        if self.error.is_some() {
            return;
        }
        let res = self
            .inner
            .write_all(line.as_bytes())
            .and_then(|_| self.inner.write_all(b"\n"));
        if let Err(e) = res {
            self.error = Some(e);
        }
    }
}

/// Forwards trace lines to `log::trace!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn line(&mut self, line: &str) {
        log::trace!(target: "hi3_stream_decoder::fields", "{}", line);
    }
}
