use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::mem;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::debug;

use crate::cancel::{self, Signal, Trigger};
use crate::core::{trim_bom, CoreParser};
use crate::error::{self, Error};

pub(crate) const DEFAULT_CHUNK_SIZE: usize = 50;

/// One physical input line, tagged with its position in the stream.
///
/// Empty `bytes` mark a skip line (blank or comment): it keeps its number
/// through the pipeline but never becomes a record.
struct RawLine {
    number: u64,
    bytes: Vec<u8>,
}

/// The parsed counterpart of a [`RawLine`]. A real record always has at
/// least one field, so empty `fields` unambiguously mark a skip entry.
struct ParsedLine {
    number: u64,
    fields: Vec<String>,
}

enum Terminal {
    Eof,
    Failed(Error),
}

pub struct ReaderBuilder {
    delimiter: u8,
    comment: Option<u8>,
    lazy_quotes: bool,
    trim_leading_space: bool,
    trailing_comma: bool,
    #[allow(dead_code)]
    fields_per_record: Option<usize>,
    chunk_size: usize,
    threads: Option<usize>,
}

impl Default for ReaderBuilder {
    fn default() -> Self {
        Self {
            delimiter: b',',
            comment: None,
            lazy_quotes: false,
            trim_leading_space: false,
            trailing_comma: false,
            fields_per_record: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            threads: None,
        }
    }
}

impl ReaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delimiter(&mut self, delimiter: u8) -> &mut Self {
        self.delimiter = delimiter;
        self
    }

    /// Lines starting with this byte are dropped from the output. They
    /// still occupy input line numbers, so parse errors on later lines
    /// stay accurate.
    pub fn comment(&mut self, comment: u8) -> &mut Self {
        self.comment = Some(comment);
        self
    }

    /// Allow a quote to appear in an unquoted field, and a lone quote in a
    /// quoted field.
    pub fn lazy_quotes(&mut self, yes: bool) -> &mut Self {
        self.lazy_quotes = yes;
        self
    }

    /// Ignore leading spaces and tabs in fields.
    pub fn trim_leading_space(&mut self, yes: bool) -> &mut Self {
        self.trim_leading_space = yes;
        self
    }

    /// Let a record end on a dangling delimiter, yielding a final empty
    /// field instead of an error.
    pub fn trailing_comma(&mut self, yes: bool) -> &mut Self {
        self.trailing_comma = yes;
        self
    }

    /// Expected number of fields per record.
    ///
    /// Kept for API compatibility with sequential readers; records keep
    /// whatever arity they were parsed with.
    pub fn fields_per_record(&mut self, fields: Option<usize>) -> &mut Self {
        self.fields_per_record = fields;
        self
    }

    /// Number of lines handed to a parser worker at a time. Defaults to 50;
    /// 0 is coerced to 1.
    pub fn chunk_size(&mut self, chunk_size: usize) -> &mut Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Number of parser workers. Defaults to the number of available cores.
    pub fn threads(&mut self, threads: usize) -> &mut Self {
        self.threads = Some(threads);
        self
    }

    pub fn from_reader<R: Read + Send + 'static>(&self, reader: R) -> Reader<R> {
        Reader {
            parser: CoreParser::new(
                self.delimiter,
                self.lazy_quotes,
                self.trim_leading_space,
                self.trailing_comma,
            ),
            comment: self.comment,
            chunk_size: self.chunk_size,
            threads: self.threads.unwrap_or_else(num_cpus::get).max(1),
            source: Some(reader),
            pipeline: None,
            next_line: 0,
            pending: HashMap::new(),
            terminal: None,
            delivered: 0,
            closed: false,
        }
    }
}

struct Pipeline {
    parsed_rx: Receiver<Vec<ParsedLine>>,
    terminal_rx: Receiver<Result<(), Error>>,
    trigger: Trigger,
    handles: Vec<JoinHandle<()>>,
}

/// A CSV reader that splits its input into numbered line batches, parses
/// the batches on a pool of workers and hands records back in strict input
/// order.
///
/// Because the input is split on raw `\n` bytes before any parsing
/// happens, quoted fields cannot contain newlines.
pub struct Reader<R> {
    parser: CoreParser,
    comment: Option<u8>,
    chunk_size: usize,
    threads: usize,
    source: Option<R>,
    pipeline: Option<Pipeline>,
    next_line: u64,
    pending: HashMap<u64, Vec<String>>,
    terminal: Option<Terminal>,
    delivered: u64,
    closed: bool,
}

impl<R: Read + Send + 'static> Reader<R> {
    pub fn from_reader(reader: R) -> Self {
        ReaderBuilder::new().from_reader(reader)
    }

    fn start(&mut self) {
        if self.pipeline.is_some() || self.terminal.is_some() {
            return;
        }

        let source = match self.source.take() {
            Some(source) => source,
            None => return,
        };

        debug!(
            "starting csv read pipeline: {} parser workers, chunk size {}",
            self.threads, self.chunk_size
        );

        let (raw_tx, raw_rx) = bounded::<Vec<RawLine>>(self.threads);
        let (parsed_tx, parsed_rx) = bounded::<Vec<ParsedLine>>(self.threads);
        let (status_tx, status_rx) = bounded::<Result<(), Error>>(self.threads + 1);
        let (terminal_tx, terminal_rx) = bounded::<Result<(), Error>>(1);
        let (trigger, signal) = cancel::trigger();

        let mut handles = Vec::with_capacity(self.threads + 2);

        {
            let signal = signal.clone();
            let status_tx = status_tx.clone();
            let chunk_size = self.chunk_size;
            let comment = self.comment;

            handles.push(thread::spawn(move || {
                let status = split_lines(source, &raw_tx, &signal, chunk_size, comment);
                let _ = status_tx.send(status);
            }));
        }

        for _ in 0..self.threads {
            let raw_rx = raw_rx.clone();
            let parsed_tx = parsed_tx.clone();
            let signal = signal.clone();
            let status_tx = status_tx.clone();
            let parser = self.parser;

            handles.push(thread::spawn(move || {
                let status = parse_batches(parser, &raw_rx, &parsed_tx, &signal);
                let _ = status_tx.send(status);
            }));
        }

        // Only the threads may keep senders alive, otherwise the channels
        // never disconnect.
        drop(raw_rx);
        drop(parsed_tx);
        drop(status_tx);

        {
            let trigger = trigger.clone();
            let statuses = self.threads + 1;

            handles.push(thread::spawn(move || {
                let mut terminal = Ok(());

                for _ in 0..statuses {
                    match status_rx.recv() {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            if terminal.is_ok() {
                                terminal = Err(err);
                                // Stop the splitter and the remaining
                                // workers instead of letting them chew
                                // through a stream nobody will consume.
                                trigger.pull();
                            }
                        }
                        Err(_) => break,
                    }
                }

                let _ = terminal_tx.send(terminal);
            }));
        }

        self.pipeline = Some(Pipeline {
            parsed_rx,
            terminal_rx,
            trigger,
            handles,
        });
    }

    /// Return the next record in input order, or `Ok(None)` at end of
    /// stream.
    ///
    /// The first call starts the background pipeline. After a terminal
    /// error every subsequent call returns that same error.
    pub fn read(&mut self) -> error::Result<Option<Vec<String>>> {
        self.start();

        loop {
            match &self.terminal {
                Some(Terminal::Eof) => return Ok(None),
                Some(Terminal::Failed(err)) => return Err(err.duplicate()),
                None => {}
            }

            if let Some(fields) = self.pending.remove(&self.next_line) {
                self.next_line += 1;

                if fields.is_empty() {
                    continue;
                }

                self.delivered += 1;

                if self.delivered % 100_000 == 0 {
                    debug!("delivered {} csv records", self.delivered);
                }

                return Ok(Some(fields));
            }

            let pipeline = match &self.pipeline {
                Some(pipeline) => pipeline,
                None => return Ok(None),
            };

            match pipeline.parsed_rx.recv() {
                Ok(parsed) => {
                    for line in parsed {
                        self.pending.insert(line.number, line.fields);
                    }
                }
                Err(_) => {
                    let terminal = match pipeline.terminal_rx.recv() {
                        Ok(Ok(())) | Err(_) => Terminal::Eof,
                        Ok(Err(err)) => {
                            self.pending.clear();
                            Terminal::Failed(err)
                        }
                    };

                    self.terminal = Some(terminal);
                }
            }
        }
    }

    /// Drain the stream into a vector. End of stream is not an error.
    pub fn read_all(&mut self) -> error::Result<Vec<Vec<String>>> {
        let mut records = Vec::new();

        while let Some(record) = self.read()? {
            records.push(record);
        }

        Ok(records)
    }

    pub fn records(&mut self) -> RecordsIter<'_, R> {
        RecordsIter { reader: self }
    }

    pub fn into_records(self) -> RecordsIntoIter<R> {
        RecordsIntoIter { reader: self }
    }

    /// Consume the reader and deliver records on a channel, with a
    /// capacity-1 error channel for the terminal error. Both channels close
    /// once the stream ends either way.
    pub fn stream(mut self) -> (Receiver<Vec<String>>, Receiver<Error>) {
        let (record_tx, record_rx) = bounded(self.chunk_size);
        let (error_tx, error_rx) = bounded(1);

        thread::spawn(move || {
            loop {
                match self.read() {
                    Ok(Some(record)) => {
                        if record_tx.send(record).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = error_tx.send(err);
                        break;
                    }
                }
            }

            let _ = self.close();
        });

        (record_rx, error_rx)
    }
}

impl<R> Reader<R> {
    /// Stop the pipeline and release the byte source. Idempotent; reading
    /// after close reports end of stream.
    pub fn close(&mut self) -> error::Result<()> {
        if self.closed {
            return Ok(());
        }

        self.closed = true;
        self.source = None;

        if let Some(pipeline) = self.pipeline.take() {
            let Pipeline {
                parsed_rx,
                terminal_rx,
                trigger,
                handles,
            } = pipeline;

            trigger.pull();
            drop(parsed_rx);
            drop(terminal_rx);

            for handle in handles {
                let _ = handle.join();
            }
        }

        if self.terminal.is_none() {
            self.terminal = Some(Terminal::Eof);
        }

        Ok(())
    }
}

impl<R> Drop for Reader<R> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

pub struct RecordsIter<'r, R> {
    reader: &'r mut Reader<R>,
}

impl<'r, R: Read + Send + 'static> Iterator for RecordsIter<'r, R> {
    type Item = error::Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

pub struct RecordsIntoIter<R> {
    reader: Reader<R>,
}

impl<R: Read + Send + 'static> Iterator for RecordsIntoIter<R> {
    type Item = error::Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// Send a value downstream unless the pipeline is being torn down. Returns
/// false when the task should stop.
fn send_or_cancel<T>(tx: &Sender<T>, signal: &Signal, value: T) -> bool {
    select! {
        send(tx, value) -> res => res.is_ok(),
        recv(signal.receiver()) -> _ => false,
    }
}

/// The splitter task: break the source into physical lines, tag skip
/// lines, group lines into numbered batches of `chunk_size`.
fn split_lines<R: Read>(
    source: R,
    raw_tx: &Sender<Vec<RawLine>>,
    signal: &Signal,
    chunk_size: usize,
    comment: Option<u8>,
) -> Result<(), Error> {
    let mut reader = BufReader::new(source);
    let mut batch: Vec<RawLine> = Vec::with_capacity(chunk_size);
    let mut line: Vec<u8> = Vec::new();
    let mut number: u64 = 0;
    let mut first_line = true;

    loop {
        line.clear();

        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => return Err(err.into()),
        }

        if first_line {
            first_line = false;

            let bom = line.len() - trim_bom(&line).len();

            if bom > 0 {
                line.drain(..bom);

                if line.is_empty() {
                    continue;
                }
            }
        }

        let first = line[0];

        // A lone carriage return is a Windows double-terminator artifact;
        // it does not consume a line number.
        if first == b'\r' {
            continue;
        }

        let bytes = if first == b'\n' || comment == Some(first) {
            Vec::new()
        } else {
            mem::take(&mut line)
        };

        batch.push(RawLine { number, bytes });
        number += 1;

        if batch.len() == chunk_size {
            let full = mem::replace(&mut batch, Vec::with_capacity(chunk_size));

            if !send_or_cancel(raw_tx, signal, full) {
                return Ok(());
            }
        }
    }

    if !batch.is_empty() {
        send_or_cancel(raw_tx, signal, batch);
    }

    Ok(())
}

/// A parser worker: sequentially parse each line of a batch, preserving
/// line numbers. The first grammar violation aborts the worker with the
/// error stamped with its 1-based input line.
fn parse_batches(
    parser: CoreParser,
    raw_rx: &Receiver<Vec<RawLine>>,
    parsed_tx: &Sender<Vec<ParsedLine>>,
    signal: &Signal,
) -> Result<(), Error> {
    for batch in raw_rx.iter() {
        let mut parsed = Vec::with_capacity(batch.len());

        for line in batch {
            if line.bytes.is_empty() {
                parsed.push(ParsedLine {
                    number: line.number,
                    fields: Vec::new(),
                });
                continue;
            }

            let mut fields = Vec::new();

            if let Err(mut err) = parser.parse_line(&line.bytes, &mut fields) {
                err.line = line.number + 1;
                return Err(err.into());
            }

            parsed.push(ParsedLine {
                number: line.number,
                fields,
            });
        }

        if !send_or_cancel(parsed_tx, signal, parsed) {
            return Ok(());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read};

    use crate::error::ParseErrorKind;

    use super::*;

    fn strings(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    fn read_all(data: &'static [u8]) -> error::Result<Vec<Vec<String>>> {
        Reader::from_reader(Cursor::new(data)).read_all()
    }

    #[test]
    fn test_read() -> error::Result<()> {
        let mut reader = Reader::from_reader(Cursor::new("a,b,c\n"));

        assert_eq!(reader.read()?, Some(strings(&["a", "b", "c"])));
        assert_eq!(reader.read()?, None);
        // end of stream is latched
        assert_eq!(reader.read()?, None);

        Ok(())
    }

    #[test]
    fn test_read_all() -> error::Result<()> {
        let tests: &[(&[u8], Vec<Vec<&str>>)] = &[
            (b"", vec![]),
            (b"a,b,c\n", vec![vec!["a", "b", "c"]]),
            (b"a,b,c", vec![vec!["a", "b", "c"]]),
            (b"a,b\r\nc,d\r\n", vec![vec!["a", "b"], vec!["c", "d"]]),
            (
                b"a,b,c\n\nd,e,f\n\n",
                vec![vec!["a", "b", "c"], vec!["d", "e", "f"]],
            ),
            (
                b"one,1\ntwo,2\nthree,3",
                vec![vec!["one", "1"], vec!["two", "2"], vec!["three", "3"]],
            ),
            (
                b"\"quoted,delim\",plain\nnext,\"row\"\n",
                vec![vec!["quoted,delim", "plain"], vec!["next", "row"]],
            ),
        ];

        for (data, expected) in tests {
            let expected: Vec<Vec<String>> =
                expected.iter().map(|record| strings(record)).collect();

            assert_eq!(read_all(*data)?, expected, "data={:?}", data);
        }

        Ok(())
    }

    #[test]
    fn test_comment_lines() -> error::Result<()> {
        let mut reader = ReaderBuilder::new()
            .comment(b'#')
            .from_reader(Cursor::new("#1,2,3\na,b,c\n#comment"));

        assert_eq!(reader.read_all()?, vec![strings(&["a", "b", "c"])]);

        Ok(())
    }

    #[test]
    fn test_bom_stripped() -> error::Result<()> {
        assert_eq!(
            read_all(b"\xef\xbb\xbfname,age\njohn,42\n")?,
            vec![strings(&["name", "age"]), strings(&["john", "42"])],
        );

        Ok(())
    }

    #[test]
    fn test_alternate_delimiter() -> error::Result<()> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b';')
            .from_reader(Cursor::new("a;b,c\nd;e\n"));

        assert_eq!(
            reader.read_all()?,
            vec![strings(&["a", "b,c"]), strings(&["d", "e"])],
        );

        Ok(())
    }

    #[test]
    fn test_trim_leading_space() -> error::Result<()> {
        let mut reader = ReaderBuilder::new()
            .trim_leading_space(true)
            .from_reader(Cursor::new("a,  b,\tc\n"));

        assert_eq!(reader.read_all()?, vec![strings(&["a", "b", "c"])]);

        Ok(())
    }

    #[test]
    fn test_parse_error_line() {
        let data = "a,bb,c\na,bb,c\na,bb,c\na,b\"b,c\na,bb,c\n";

        let mut reader = Reader::from_reader(Cursor::new(data));
        let err = reader.read_all().unwrap_err();

        let parse = err.as_parse().expect("expected a parse error");
        assert_eq!(parse.line, 4);
        assert_eq!(parse.kind, ParseErrorKind::BareQuote);

        // the terminal error is latched
        let again = reader.read().unwrap_err();
        assert_eq!(again.as_parse().map(|p| p.line), Some(4));
    }

    #[test]
    fn test_parse_error_line_after_comments() {
        // Comment and blank lines occupy line numbers, so the reported
        // line must match the physical input.
        let data = "#header\n\na,b\"b\n";

        let mut reader = ReaderBuilder::new()
            .comment(b'#')
            .from_reader(Cursor::new(data));

        let err = reader.read_all().unwrap_err();
        assert_eq!(err.as_parse().map(|p| p.line), Some(3));
    }

    #[test]
    fn test_lazy_quotes() -> error::Result<()> {
        let mut reader = ReaderBuilder::new()
            .lazy_quotes(true)
            .from_reader(Cursor::new("a,b\"b,c\n"));

        assert_eq!(reader.read_all()?, vec![strings(&["a", "b\"b", "c"])]);

        Ok(())
    }

    #[test]
    fn test_chunk_size_independence() -> error::Result<()> {
        let mut data = String::new();
        let mut expected = Vec::new();

        for i in 0..100 {
            data.push_str(&format!("row{},value{},x\n", i, i));
            expected.push(strings(&[
                &format!("row{}", i),
                &format!("value{}", i),
                "x",
            ]));

            if i % 10 == 0 {
                data.push('\n');
            }
        }

        for chunk_size in [1, 2, 3, 7, 50, 1000] {
            let mut reader = ReaderBuilder::new()
                .chunk_size(chunk_size)
                .from_reader(Cursor::new(data.clone()));

            assert_eq!(reader.read_all()?, expected, "chunk_size={}", chunk_size);
        }

        Ok(())
    }

    #[test]
    fn test_order_preserved_under_contention() -> error::Result<()> {
        let mut data = String::new();

        for i in 0..1000 {
            data.push_str(&format!("{},record\n", i));
        }

        let mut reader = ReaderBuilder::new()
            .chunk_size(1)
            .threads(4)
            .from_reader(Cursor::new(data));

        let records = reader.read_all()?;

        assert_eq!(records.len(), 1000);

        for (i, record) in records.iter().enumerate() {
            assert_eq!(record[0], i.to_string());
        }

        Ok(())
    }

    #[test]
    fn test_records_iterators() -> error::Result<()> {
        let mut reader = Reader::from_reader(Cursor::new("a,b\nc,d\n"));

        let records = reader.records().collect::<Result<Vec<_>, _>>()?;
        assert_eq!(records, vec![strings(&["a", "b"]), strings(&["c", "d"])]);

        let reader = Reader::from_reader(Cursor::new("a,b\nc,d\n"));

        let records = reader.into_records().collect::<Result<Vec<_>, _>>()?;
        assert_eq!(records, vec![strings(&["a", "b"]), strings(&["c", "d"])]);

        Ok(())
    }

    #[test]
    fn test_stream() {
        let reader = Reader::from_reader(Cursor::new("a,b\nc,d\n"));
        let (record_rx, error_rx) = reader.stream();

        let records: Vec<_> = record_rx.iter().collect();
        assert_eq!(records, vec![strings(&["a", "b"]), strings(&["c", "d"])]);

        // no terminal error: the error channel just closes
        assert!(error_rx.recv().is_err());
    }

    #[test]
    fn test_stream_error() {
        let reader = Reader::from_reader(Cursor::new("ok,line\nbad\"line\n"));
        let (record_rx, error_rx) = reader.stream();

        // drain whatever made it through, then collect the error
        for _ in record_rx.iter() {}

        let err = error_rx.recv().expect("expected a terminal error");
        assert_eq!(err.as_parse().map(|p| p.line), Some(2));
    }

    #[test]
    fn test_close_idempotent() -> error::Result<()> {
        let mut reader = Reader::from_reader(Cursor::new("a,b\nc,d\n"));

        assert_eq!(reader.read()?, Some(strings(&["a", "b"])));

        reader.close()?;
        reader.close()?;

        // reads after close terminate instead of hanging
        assert_eq!(reader.read()?, None);

        Ok(())
    }

    #[test]
    fn test_close_before_read() -> error::Result<()> {
        let mut reader = Reader::from_reader(Cursor::new("a,b\n"));

        reader.close()?;

        assert_eq!(reader.read()?, None);

        Ok(())
    }

    #[test]
    fn test_close_mid_stream_drains() -> error::Result<()> {
        let mut data = String::new();

        for i in 0..10_000 {
            data.push_str(&format!("{},x,y\n", i));
        }

        let mut reader = ReaderBuilder::new()
            .chunk_size(10)
            .from_reader(Cursor::new(data));

        for _ in 0..5 {
            reader.read()?;
        }

        // close joins every background task, so returning at all proves
        // the pipeline drained
        reader.close()?;

        assert_eq!(reader.read()?, None);

        Ok(())
    }

    struct FailingSource {
        data: Cursor<&'static [u8]>,
        done: bool,
    }

    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.data.read(buf)?;

            if n > 0 {
                return Ok(n);
            }

            if self.done {
                return Ok(0);
            }

            self.done = true;
            Err(io::Error::new(io::ErrorKind::Other, "source went away"))
        }
    }

    #[test]
    fn test_source_error_is_terminal() {
        let source = FailingSource {
            data: Cursor::new(b"a,b\nc,d\n"),
            done: false,
        };

        let mut reader = Reader::from_reader(source);
        let err = reader.read_all().unwrap_err();

        assert!(err.is_io());

        let again = reader.read().unwrap_err();
        assert!(again.is_io());
    }
}
