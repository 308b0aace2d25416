use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::io::{self, Write};
use std::thread;
use tracing_subscriber::fmt::MakeWriter;

/// Asynchronous log sink: formatted lines go into a bounded queue drained
/// by one writer thread. When the queue is full the line is dropped on the
/// floor; the dispatcher is never blocked by logging.
#[derive(Clone)]
pub struct AsyncSink {
    tx: Sender<Vec<u8>>,
}

impl AsyncSink {
    pub fn new(capacity: usize) -> io::Result<AsyncSink> {
        let (tx, rx) = bounded::<Vec<u8>>(capacity.max(1));
        thread::Builder::new()
            .name("muon-log".into())
            .spawn(move || drain(rx))?;
        Ok(AsyncSink { tx })
    }

    #[cfg(test)]
    fn with_channel(capacity: usize) -> (AsyncSink, Receiver<Vec<u8>>) {
        let (tx, rx) = bounded::<Vec<u8>>(capacity);
        (AsyncSink { tx }, rx)
    }
}

fn drain(rx: Receiver<Vec<u8>>) {
    let stderr = io::stderr();
    for line in rx {
        let _ = stderr.lock().write_all(&line);
    }
}

impl<'a> MakeWriter<'a> for AsyncSink {
    type Writer = QueueWriter;

    fn make_writer(&'a self) -> QueueWriter {
        QueueWriter {
            buf: Vec::new(),
            tx: self.tx.clone(),
        }
    }
}

/// Accumulates one formatted event, handing it to the queue on flush/drop.
pub struct QueueWriter {
    buf: Vec<u8>,
    tx: Sender<Vec<u8>>,
}

impl Write for QueueWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let line = std::mem::take(&mut self.buf);
        match self.tx.try_send(line) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Ok(())
            }
        }
    }
}

impl Drop for QueueWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
