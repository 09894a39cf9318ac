//! Entry point of the out-of-process detector.
//!
//! Reads one `WorkerRequest` from its input, runs detection, and writes each
//! message as a JSON line to its output. Closing the output ends the stream.

use super::{find_events, MessageSink};
use crate::pipeline::{encode_line, Message, WorkerRequest};
use anyhow::{Context, Result};
use log::info;
use std::io::{Read, Write};

/// Writes messages as newline-delimited JSON, flushing after each line.
pub struct LineSink<W: Write> {
    writer: W,
}

impl<W: Write> LineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> MessageSink for LineSink<W> {
    fn send(&mut self, message: Message) -> Result<()> {
        let line = encode_line(&message)?;
        self.writer
            .write_all(line.as_bytes())
            .context("writing message")?;
        self.writer.flush()?;
        Ok(())
    }
}

pub fn serve(mut input: impl Read, output: impl Write) -> Result<usize> {
    let mut request = String::new();
    input
        .read_to_string(&mut request)
        .context("reading worker request")?;
    let request: WorkerRequest =
        serde_json::from_str(&request).context("parsing worker request")?;
    info!(
        "Detecting events in {} file(s)",
        request.filenames.len()
    );
    let mut sink = LineSink::new(output);
    let total = find_events(&request.filenames, &request.config, &mut sink)?;
    info!("Detection finished with {} events", total);
    Ok(total)
}
