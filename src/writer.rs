use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::mem;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::debug;

use crate::core::CoreEncoder;
use crate::error::{self, Error};
use crate::reader::DEFAULT_CHUNK_SIZE;

/// A numbered group of records on its way to the encoder pool. Zero
/// records mark a flush fence.
struct InputBatch {
    number: u64,
    records: Vec<Vec<String>>,
}

/// The encoded counterpart of an [`InputBatch`]. `None` carries the flush
/// fence through to the serializer in batch order.
struct EncodedChunk {
    number: u64,
    bytes: Option<Vec<u8>>,
}

pub struct WriterBuilder {
    delimiter: u8,
    crlf: bool,
    chunk_size: usize,
    threads: Option<usize>,
}

impl Default for WriterBuilder {
    fn default() -> Self {
        Self {
            delimiter: b',',
            crlf: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            threads: None,
        }
    }
}

impl WriterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delimiter(&mut self, delimiter: u8) -> &mut Self {
        self.delimiter = delimiter;
        self
    }

    /// Terminate records with `\r\n` instead of `\n`.
    pub fn crlf(&mut self, yes: bool) -> &mut Self {
        self.crlf = yes;
        self
    }

    /// Number of records handed to an encoder worker at a time. Defaults
    /// to 50; 0 is coerced to 1.
    pub fn chunk_size(&mut self, chunk_size: usize) -> &mut Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Number of encoder workers. Defaults to the number of available
    /// cores.
    pub fn threads(&mut self, threads: usize) -> &mut Self {
        self.threads = Some(threads);
        self
    }

    pub fn from_writer<W: Write + Send + 'static>(&self, writer: W) -> Writer {
        let threads = self.threads.unwrap_or_else(num_cpus::get).max(1);

        debug!(
            "starting csv write pipeline: {} encoder workers, chunk size {}",
            threads, self.chunk_size
        );

        let (input_tx, input_rx) = bounded::<InputBatch>(threads);
        let (encoded_tx, encoded_rx) = bounded::<EncodedChunk>(threads);
        // Encode buffers cycle between the serializer and the encoders
        // through this free list.
        let (pool_tx, pool_rx) = unbounded::<Vec<u8>>();
        let (flush_tx, flush_rx) = bounded::<()>(0);
        let (error_tx, error_rx) = bounded::<Error>(1);

        let mut handles = Vec::with_capacity(threads + 1);
        let encoder = CoreEncoder::new(self.delimiter, self.crlf);

        for _ in 0..threads {
            let input_rx = input_rx.clone();
            let encoded_tx = encoded_tx.clone();
            let pool_rx = pool_rx.clone();

            handles.push(thread::spawn(move || {
                encode_batches(encoder, &input_rx, &encoded_tx, &pool_rx);
            }));
        }

        drop(input_rx);
        drop(encoded_tx);
        drop(pool_rx);

        handles.push(thread::spawn(move || {
            serialize_chunks(writer, &encoded_rx, &pool_tx, &flush_tx, &error_tx);
        }));

        Writer {
            chunk_size: self.chunk_size,
            pending: Vec::with_capacity(self.chunk_size),
            next_batch: 0,
            input_tx: Some(input_tx),
            flush_rx,
            error_rx,
            handles,
            terminal: None,
            closed: false,
        }
    }
}

/// A CSV writer that accumulates records into numbered batches, encodes
/// the batches on a pool of workers and serializes the results to the
/// sink in strict batch order.
///
/// The sink is owned by a background task from construction on; `close`
/// (or dropping the writer) flushes and releases it.
pub struct Writer {
    chunk_size: usize,
    pending: Vec<Vec<String>>,
    next_batch: u64,
    input_tx: Option<Sender<InputBatch>>,
    flush_rx: Receiver<()>,
    error_rx: Receiver<Error>,
    handles: Vec<JoinHandle<()>>,
    terminal: Option<Error>,
    closed: bool,
}

impl Writer {
    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        WriterBuilder::new().from_writer(writer)
    }

    fn poll_error(&mut self) {
        if self.terminal.is_none() {
            if let Ok(err) = self.error_rx.try_recv() {
                self.terminal = Some(err);
            }
        }
    }

    fn latched(&self) -> error::Result<()> {
        match &self.terminal {
            Some(err) => Err(err.duplicate()),
            None => Ok(()),
        }
    }

    fn check_error(&mut self) -> error::Result<()> {
        self.poll_error();
        self.latched()
    }

    fn send_batch(&mut self, records: Vec<Vec<String>>) -> error::Result<()> {
        let batch = InputBatch {
            number: self.next_batch,
            records,
        };

        match &self.input_tx {
            Some(input_tx) if input_tx.send(batch).is_ok() => {
                self.next_batch += 1;
                Ok(())
            }
            _ => Err(Error::closed()),
        }
    }

    fn send_pending(&mut self) -> error::Result<()> {
        let records = mem::replace(&mut self.pending, Vec::with_capacity(self.chunk_size));
        self.send_batch(records)
    }

    /// Enqueue one record.
    ///
    /// The record may not reach the sink until the current batch fills up
    /// or [`flush`](Self::flush) is called. A record with no fields has no
    /// representation on the wire and is silently dropped.
    pub fn write(&mut self, record: Vec<String>) -> error::Result<()> {
        self.check_error()?;

        if record.is_empty() {
            return Ok(());
        }

        if self.closed {
            return Err(Error::closed());
        }

        self.pending.push(record);

        if self.pending.len() >= self.chunk_size {
            self.send_pending()?;
        }

        Ok(())
    }

    /// Write every record, then [`flush`](Self::flush).
    pub fn write_all<I>(&mut self, records: I) -> error::Result<()>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        for record in records {
            self.write(record)?;
        }

        self.flush()
    }

    /// Block until everything enqueued so far has been encoded, written
    /// out and flushed through to the sink.
    pub fn flush(&mut self) -> error::Result<()> {
        self.check_error()?;

        if self.input_tx.is_none() {
            return Err(Error::closed());
        }

        if !self.pending.is_empty() {
            self.send_pending()?;
        }

        // The fence travels the pipeline in batch order; once the
        // serializer reaches it, everything before it is in the sink.
        self.send_batch(Vec::new())?;

        // Answered even after a sink error, so this cannot hang.
        let _ = self.flush_rx.recv();

        self.check_error()
    }

    /// Return the latched terminal error, if any write or flush has
    /// failed so far.
    pub fn error(&mut self) -> error::Result<()> {
        self.poll_error();
        self.latched()
    }

    /// Flush, stop the pipeline and release the sink. Idempotent; repeated
    /// calls return the same status.
    pub fn close(&mut self) -> error::Result<()> {
        if self.closed {
            return self.latched();
        }

        self.closed = true;

        let flushed = self.flush();

        // Closing the input channel lets the encoders drain and exit; the
        // serializer follows once the encoded channel disconnects,
        // flushing and dropping the sink on its way out.
        self.input_tx = None;

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }

        self.poll_error();

        match flushed {
            Err(err) => {
                if self.terminal.is_none() {
                    self.terminal = Some(err.duplicate());
                }
                Err(err)
            }
            Ok(()) => self.latched(),
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// An encoder worker: turn record batches into byte buffers, forwarding
/// fences untouched. Encoding into memory cannot fail.
fn encode_batches(
    encoder: CoreEncoder,
    input_rx: &Receiver<InputBatch>,
    encoded_tx: &Sender<EncodedChunk>,
    pool_rx: &Receiver<Vec<u8>>,
) {
    for batch in input_rx.iter() {
        let chunk = if batch.records.is_empty() {
            EncodedChunk {
                number: batch.number,
                bytes: None,
            }
        } else {
            let mut buffer = pool_rx.try_recv().unwrap_or_default();
            buffer.clear();

            for record in &batch.records {
                encoder.encode_record(record, &mut buffer);
            }

            EncodedChunk {
                number: batch.number,
                bytes: Some(buffer),
            }
        };

        if encoded_tx.send(chunk).is_err() {
            return;
        }
    }
}

/// The serializer task: reassemble encoded chunks in batch order over a
/// buffered sink. The first sink error is latched and reported; from then
/// on the serializer keeps draining chunks and answering fences so nothing
/// upstream can block forever.
fn serialize_chunks<W: Write>(
    writer: W,
    encoded_rx: &Receiver<EncodedChunk>,
    pool_tx: &Sender<Vec<u8>>,
    flush_tx: &Sender<()>,
    error_tx: &Sender<Error>,
) {
    let mut output = BufWriter::new(writer);
    let mut next_out: u64 = 0;
    let mut stash: HashMap<u64, Option<Vec<u8>>> = HashMap::new();
    let mut failed = false;

    for chunk in encoded_rx.iter() {
        stash.insert(chunk.number, chunk.bytes);

        while let Some(bytes) = stash.remove(&next_out) {
            next_out += 1;

            match bytes {
                Some(buffer) => {
                    if !failed {
                        if let Err(err) = output.write_all(&buffer) {
                            failed = true;
                            let _ = error_tx.try_send(err.into());
                        }
                    }

                    let _ = pool_tx.send(buffer);
                }
                None => {
                    if !failed {
                        if let Err(err) = output.flush() {
                            failed = true;
                            let _ = error_tx.try_send(err.into());
                        }
                    }

                    let _ = flush_tx.send(());
                }
            }
        }
    }

    if !failed {
        if let Err(err) = output.flush() {
            let _ = error_tx.try_send(err.into());
        }
    }

    // Dropping the buffered writer releases the sink.
}
